use std::sync::Arc;

use anyhow::{anyhow, Result};
use cohort_utils::{get_epoch_time_in_ms, OptionInspectNone};
use data_model::{
    CohortResult, DatedMeasure, DomainError, JobRecordRef, QuerySnapshot, Request,
};
use rocksdb::{
    AsColumnFamilyRef, BoundColumnFamily, Direction, IteratorMode, ReadOptions, Transaction,
    TransactionDB,
};
use strum::AsRefStr;

use crate::{
    requests::{
        CohortJobOutcome, CreateCohortRequest, CreateMeasureRequest, CreateRequestRequest,
        CreateSnapshotRequest, DeleteCohortRequest, DeleteMeasureRequest,
        FinalizeCohortJobRequest, FinalizeMeasureJobRequest, KillJobRequest,
        MarkJobStartedRequest, MarkSnapshotSavedRequest, MeasureJobOutcome, SetJobHandleRequest,
        TombstoneRequestRequest, UpdateCohortMetadataRequest, UpdateRequestMetadataRequest,
    },
    serializer::{JsonEncode, JsonEncoder},
};

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum CohortObjectsColumns {
    Requests,  //  RequestId -> Request
    Snapshots, //  SnapshotId -> QuerySnapshot
    Measures,  //  MeasureId -> DatedMeasure
    Cohorts,   //  CohortId -> CohortResult

    RequestSnapshots, //  RequestId|SnapshotId -> Empty
    SnapshotChildren, //  ParentSnapshotId|ChildSnapshotId -> Empty
    SavedSnapshots,   //  RequestId -> SnapshotId
    CohortsByMeasure, //  MeasureId|CohortId -> Empty
}

impl CohortObjectsColumns {
    pub fn cf_db<'a>(&'a self, db: &'a TransactionDB) -> Arc<BoundColumnFamily<'a>> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", self.as_ref());
            })
            .unwrap()
    }
}

fn index_key(prefix: &str, suffix: &str) -> String {
    format!("{}|{}", prefix, suffix)
}

pub fn make_prefix_iterator<'a>(
    txn: &'a Transaction<TransactionDB>,
    cf_handle: &impl AsColumnFamilyRef,
    prefix: &'a [u8],
) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + 'a {
    let mut read_options = ReadOptions::default();
    read_options.set_readahead_size(4_194_304);
    let iter = txn.iterator_cf_opt(
        cf_handle,
        read_options,
        IteratorMode::From(prefix, Direction::Forward),
    );
    iter.map(|item| item.map_err(|e| anyhow!(e.to_string())))
        .take_while(move |item| match item {
            Ok((key, _)) => key.starts_with(prefix),
            Err(_) => true,
        })
}

pub(crate) fn create_request(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateRequestRequest,
) -> Result<()> {
    let serialized = JsonEncoder::encode(&req.request)?;
    txn.put_cf(
        &CohortObjectsColumns::Requests.cf_db(&db),
        req.request.id.get(),
        serialized,
    )?;
    Ok(())
}

pub(crate) fn update_request_metadata(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &UpdateRequestMetadataRequest,
) -> Result<()> {
    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Requests.cf_db(&db),
            req.request_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("request", &req.request_id))?;
    let mut request: Request = JsonEncoder::decode(&bytes)?;
    if request.is_tombstoned() {
        return Err(DomainError::not_found("request", &req.request_id).into());
    }
    if let Some(name) = &req.name {
        request.name = name.clone();
    }
    if let Some(description) = &req.description {
        request.description = description.clone();
    }
    if let Some(favorite) = req.favorite {
        request.favorite = favorite;
    }
    let serialized = JsonEncoder::encode(&request)?;
    txn.put_cf(
        &CohortObjectsColumns::Requests.cf_db(&db),
        request.id.get(),
        serialized,
    )?;
    Ok(())
}

/// Soft delete. The request and every snapshot under it get a tombstone in
/// the same transaction; measures and cohorts stay readable as history.
pub(crate) fn tombstone_request(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &TombstoneRequestRequest,
) -> Result<()> {
    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Requests.cf_db(&db),
            req.request_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("request", &req.request_id))?;
    let mut request: Request = JsonEncoder::decode(&bytes)?;
    if request.is_tombstoned() {
        return Ok(());
    }
    let now = get_epoch_time_in_ms();
    request.tombstone(now);
    txn.put_cf(
        &CohortObjectsColumns::Requests.cf_db(&db),
        request.id.get(),
        JsonEncoder::encode(&request)?,
    )?;

    let prefix = format!("{}|", req.request_id);
    let snapshot_ids: Vec<String> = make_prefix_iterator(
        txn,
        &CohortObjectsColumns::RequestSnapshots.cf_db(&db),
        prefix.as_bytes(),
    )
    .map(|item| {
        let (key, _) = item?;
        let key = String::from_utf8(key.to_vec())?;
        Ok(key
            .split_once('|')
            .map(|(_, snapshot_id)| snapshot_id.to_string())
            .ok_or_else(|| anyhow!("malformed request snapshot index key: {}", key))?)
    })
    .collect::<Result<Vec<_>>>()?;

    for snapshot_id in snapshot_ids {
        let bytes = txn
            .get_for_update_cf(&CohortObjectsColumns::Snapshots.cf_db(&db), &snapshot_id, true)?
            .ok_or_else(|| anyhow!("snapshot {} indexed but missing", snapshot_id))?;
        let mut snapshot: QuerySnapshot = JsonEncoder::decode(&bytes)?;
        if snapshot.is_tombstoned() {
            continue;
        }
        snapshot.tombstoned_at = Some(now);
        txn.put_cf(
            &CohortObjectsColumns::Snapshots.cf_db(&db),
            snapshot.id.get(),
            JsonEncoder::encode(&snapshot)?,
        )?;
    }
    Ok(())
}

/// Inserts a new snapshot as the active tip of its branch.
///
/// Sibling deactivation and the insert share this transaction, so the
/// at-most-one-active-child invariant holds under concurrent creation from
/// the same parent: `get_for_update` locks serialize the racers and the last
/// committed writer owns the active child.
pub(crate) fn create_snapshot(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateSnapshotRequest,
) -> Result<()> {
    let snapshot = &req.snapshot;
    QuerySnapshot::validate_payload(&snapshot.payload)?;

    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Requests.cf_db(&db),
            snapshot.request_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("request", &snapshot.request_id))?;
    let request: Request = JsonEncoder::decode(&bytes)?;
    if request.is_tombstoned() {
        return Err(DomainError::not_found("request", &snapshot.request_id).into());
    }

    match &snapshot.previous_id {
        Some(previous_id) => {
            let bytes = txn
                .get_for_update_cf(
                    &CohortObjectsColumns::Snapshots.cf_db(&db),
                    previous_id.get(),
                    false,
                )?
                .ok_or_else(|| DomainError::not_found("snapshot", previous_id))?;
            let previous: QuerySnapshot = JsonEncoder::decode(&bytes)?;
            if previous.request_id != snapshot.request_id || previous.is_tombstoned() {
                return Err(DomainError::BranchMismatch {
                    previous: previous_id.clone(),
                    request: snapshot.request_id.clone(),
                }
                .into());
            }

            // All sibling flips land in this transaction, before the insert.
            let prefix = format!("{}|", previous_id);
            let child_ids: Vec<String> = make_prefix_iterator(
                txn,
                &CohortObjectsColumns::SnapshotChildren.cf_db(&db),
                prefix.as_bytes(),
            )
            .map(|item| {
                let (key, _) = item?;
                let key = String::from_utf8(key.to_vec())?;
                Ok(key
                    .split_once('|')
                    .map(|(_, child_id)| child_id.to_string())
                    .ok_or_else(|| anyhow!("malformed snapshot child index key: {}", key))?)
            })
            .collect::<Result<Vec<_>>>()?;

            for child_id in child_ids {
                let bytes = txn
                    .get_for_update_cf(&CohortObjectsColumns::Snapshots.cf_db(&db), &child_id, true)?
                    .ok_or_else(|| anyhow!("snapshot {} indexed but missing", child_id))?;
                let mut child: QuerySnapshot = JsonEncoder::decode(&bytes)?;
                if child.is_active_branch {
                    child.is_active_branch = false;
                    txn.put_cf(
                        &CohortObjectsColumns::Snapshots.cf_db(&db),
                        child.id.get(),
                        JsonEncoder::encode(&child)?,
                    )?;
                }
            }
        }
        None => {
            let prefix = format!("{}|", snapshot.request_id);
            let mut existing = make_prefix_iterator(
                txn,
                &CohortObjectsColumns::RequestSnapshots.cf_db(&db),
                prefix.as_bytes(),
            );
            if let Some(item) = existing.next() {
                item?;
                return Err(DomainError::NonEmptyRequest(snapshot.request_id.clone()).into());
            }
        }
    }

    let mut snapshot = snapshot.clone();
    snapshot.is_active_branch = true;
    txn.put_cf(
        &CohortObjectsColumns::Snapshots.cf_db(&db),
        snapshot.id.get(),
        JsonEncoder::encode(&snapshot)?,
    )?;
    txn.put_cf(
        &CohortObjectsColumns::RequestSnapshots.cf_db(&db),
        index_key(snapshot.request_id.get(), snapshot.id.get()),
        &[],
    )?;
    if let Some(previous_id) = &snapshot.previous_id {
        txn.put_cf(
            &CohortObjectsColumns::SnapshotChildren.cf_db(&db),
            index_key(previous_id.get(), snapshot.id.get()),
            &[],
        )?;
    }
    Ok(())
}

/// Moves the request's saved flag. Clearing the old holder and setting the
/// new one are one transaction, so the store never ends up with two saved
/// snapshots or silently zero after a partial write.
pub(crate) fn mark_snapshot_saved(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &MarkSnapshotSavedRequest,
) -> Result<()> {
    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Snapshots.cf_db(&db),
            req.snapshot_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("snapshot", &req.snapshot_id))?;
    let mut snapshot: QuerySnapshot = JsonEncoder::decode(&bytes)?;
    if snapshot.is_tombstoned() {
        return Err(DomainError::not_found("snapshot", &req.snapshot_id).into());
    }

    let previous_saved = txn.get_for_update_cf(
        &CohortObjectsColumns::SavedSnapshots.cf_db(&db),
        snapshot.request_id.get(),
        true,
    )?;
    if let Some(previous_saved) = previous_saved {
        let previous_saved = String::from_utf8(previous_saved)?;
        if previous_saved != snapshot.id.get() {
            if let Some(bytes) = txn.get_for_update_cf(
                &CohortObjectsColumns::Snapshots.cf_db(&db),
                &previous_saved,
                true,
            )? {
                let mut old: QuerySnapshot = JsonEncoder::decode(&bytes)?;
                old.is_saved = false;
                txn.put_cf(
                    &CohortObjectsColumns::Snapshots.cf_db(&db),
                    old.id.get(),
                    JsonEncoder::encode(&old)?,
                )?;
            }
        }
    }

    snapshot.is_saved = true;
    txn.put_cf(
        &CohortObjectsColumns::Snapshots.cf_db(&db),
        snapshot.id.get(),
        JsonEncoder::encode(&snapshot)?,
    )?;
    txn.put_cf(
        &CohortObjectsColumns::SavedSnapshots.cf_db(&db),
        snapshot.request_id.get(),
        snapshot.id.get(),
    )?;
    Ok(())
}

pub(crate) fn create_measure(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateMeasureRequest,
) -> Result<()> {
    let measure = &req.measure;
    let bytes = txn
        .get_cf(
            &CohortObjectsColumns::Snapshots.cf_db(&db),
            measure.snapshot_id.get(),
        )?
        .ok_or_else(|| DomainError::not_found("snapshot", &measure.snapshot_id))?;
    let snapshot: QuerySnapshot = JsonEncoder::decode(&bytes)?;
    if snapshot.is_tombstoned() {
        return Err(DomainError::not_found("snapshot", &measure.snapshot_id).into());
    }
    txn.put_cf(
        &CohortObjectsColumns::Measures.cf_db(&db),
        measure.id.get(),
        JsonEncoder::encode(measure)?,
    )?;
    Ok(())
}

/// Referential guard: a measure stays while any cohort points at it.
pub(crate) fn delete_measure(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &DeleteMeasureRequest,
) -> Result<()> {
    let prefix = format!("{}|", req.measure_id);
    let mut referencing = make_prefix_iterator(
        txn,
        &CohortObjectsColumns::CohortsByMeasure.cf_db(&db),
        prefix.as_bytes(),
    );
    if let Some(item) = referencing.next() {
        item?;
        return Err(DomainError::MeasureInUse(req.measure_id.clone()).into());
    }
    txn.get_for_update_cf(
        &CohortObjectsColumns::Measures.cf_db(&db),
        req.measure_id.get(),
        true,
    )?
    .ok_or_else(|| DomainError::not_found("measure", &req.measure_id))?;
    txn.delete_cf(
        &CohortObjectsColumns::Measures.cf_db(&db),
        req.measure_id.get(),
    )?;
    Ok(())
}

pub(crate) fn create_cohort(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &CreateCohortRequest,
) -> Result<()> {
    let cohort = &req.cohort;
    if cohort.kind.is_system_assigned() && !req.allow_system_kind {
        return Err(DomainError::KindNotSettable(cohort.kind).into());
    }
    let bytes = txn
        .get_cf(
            &CohortObjectsColumns::Snapshots.cf_db(&db),
            cohort.snapshot_id.get(),
        )?
        .ok_or_else(|| DomainError::not_found("snapshot", &cohort.snapshot_id))?;
    let snapshot: QuerySnapshot = JsonEncoder::decode(&bytes)?;
    if snapshot.is_tombstoned() {
        return Err(DomainError::not_found("snapshot", &cohort.snapshot_id).into());
    }
    let bytes = txn
        .get_cf(
            &CohortObjectsColumns::Measures.cf_db(&db),
            cohort.measure_id.get(),
        )?
        .ok_or_else(|| DomainError::not_found("measure", &cohort.measure_id))?;
    let measure: DatedMeasure = JsonEncoder::decode(&bytes)?;
    if measure.snapshot_id != cohort.snapshot_id {
        return Err(DomainError::MeasureSnapshotMismatch {
            measure: cohort.measure_id.clone(),
            snapshot: cohort.snapshot_id.clone(),
        }
        .into());
    }
    txn.put_cf(
        &CohortObjectsColumns::Cohorts.cf_db(&db),
        cohort.id.get(),
        JsonEncoder::encode(cohort)?,
    )?;
    txn.put_cf(
        &CohortObjectsColumns::CohortsByMeasure.cf_db(&db),
        index_key(cohort.measure_id.get(), cohort.id.get()),
        &[],
    )?;
    Ok(())
}

pub(crate) fn update_cohort_metadata(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &UpdateCohortMetadataRequest,
) -> Result<()> {
    let mut cohort = load_cohort_for_update(&db, txn, &req.cohort_id)?;
    if let Some(name) = &req.name {
        cohort.name = name.clone();
    }
    if let Some(description) = &req.description {
        cohort.description = description.clone();
    }
    if let Some(favorite) = req.favorite {
        cohort.favorite = favorite;
    }
    put_cohort(&db, txn, &cohort)
}

pub(crate) fn delete_cohort(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &DeleteCohortRequest,
) -> Result<()> {
    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Cohorts.cf_db(&db),
            req.cohort_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("cohort", &req.cohort_id))?;
    let cohort: CohortResult = JsonEncoder::decode(&bytes)?;
    txn.delete_cf(
        &CohortObjectsColumns::Cohorts.cf_db(&db),
        cohort.id.get(),
    )?;
    txn.delete_cf(
        &CohortObjectsColumns::CohortsByMeasure.cf_db(&db),
        index_key(cohort.measure_id.get(), cohort.id.get()),
    )?;
    Ok(())
}

fn load_measure_for_update(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    measure_id: &data_model::MeasureId,
) -> Result<DatedMeasure> {
    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Measures.cf_db(db),
            measure_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("measure", measure_id))?;
    JsonEncoder::decode(&bytes)
}

fn put_measure(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    measure: &DatedMeasure,
) -> Result<()> {
    txn.put_cf(
        &CohortObjectsColumns::Measures.cf_db(db),
        measure.id.get(),
        JsonEncoder::encode(measure)?,
    )?;
    Ok(())
}

fn load_cohort_for_update(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    cohort_id: &data_model::CohortId,
) -> Result<CohortResult> {
    let bytes = txn
        .get_for_update_cf(
            &CohortObjectsColumns::Cohorts.cf_db(db),
            cohort_id.get(),
            true,
        )?
        .ok_or_else(|| DomainError::not_found("cohort", cohort_id))?;
    JsonEncoder::decode(&bytes)
}

fn put_cohort(
    db: &Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    cohort: &CohortResult,
) -> Result<()> {
    txn.put_cf(
        &CohortObjectsColumns::Cohorts.cf_db(db),
        cohort.id.get(),
        JsonEncoder::encode(cohort)?,
    )?;
    Ok(())
}

/// Stores the queue-issued handle on a freshly dispatched record. A record
/// that already resolved keeps the engine job id the reconciler wrote; the
/// dispatch handle is stale at that point.
pub(crate) fn set_job_handle(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &SetJobHandleRequest,
) -> Result<()> {
    match &req.record {
        JobRecordRef::Measure(measure_id) => {
            let mut measure = load_measure_for_update(&db, txn, measure_id)?;
            if measure.job_status.is_terminal() {
                return Ok(());
            }
            measure.job_handle = Some(req.job_handle.clone());
            put_measure(&db, txn, &measure)
        }
        JobRecordRef::Cohort(cohort_id) => {
            let mut cohort = load_cohort_for_update(&db, txn, cohort_id)?;
            if cohort.job_status.is_terminal() {
                return Ok(());
            }
            cohort.job_handle = Some(req.job_handle.clone());
            put_cohort(&db, txn, &cohort)
        }
    }
}

pub(crate) fn mark_job_started(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &MarkJobStartedRequest,
) -> Result<()> {
    match &req.record {
        JobRecordRef::Measure(measure_id) => {
            let mut measure = load_measure_for_update(&db, txn, measure_id)?;
            measure.mark_started()?;
            put_measure(&db, txn, &measure)
        }
        JobRecordRef::Cohort(cohort_id) => {
            let mut cohort = load_cohort_for_update(&db, txn, cohort_id)?;
            cohort.mark_started()?;
            put_cohort(&db, txn, &cohort)
        }
    }
}

pub(crate) fn finalize_measure_job(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &FinalizeMeasureJobRequest,
) -> Result<()> {
    let mut measure = load_measure_for_update(&db, txn, &req.measure_id)?;
    match &req.outcome {
        MeasureJobOutcome::Success(success) => {
            measure.complete(
                success.value,
                success.computed_at,
                success.engine_job_id.clone(),
                success.duration_ms,
            )?;
        }
        MeasureJobOutcome::Failure(failure) => {
            measure.fail(failure.message.clone())?;
            if let Some(engine_job_id) = &failure.engine_job_id {
                measure.job_handle = Some(engine_job_id.clone());
            }
            measure.job_duration_ms = failure.duration_ms;
        }
    }
    put_measure(&db, txn, &measure)
}

/// Resolves a materialization job. The cohort and its bound measure settle in
/// the same transaction; readers of either row never observe a half-updated
/// pair. A measure that was reused and already terminal keeps its own
/// outcome.
pub(crate) fn finalize_cohort_job(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &FinalizeCohortJobRequest,
) -> Result<()> {
    let mut cohort = load_cohort_for_update(&db, txn, &req.cohort_id)?;
    let mut measure = load_measure_for_update(&db, txn, &cohort.measure_id)?;
    match &req.outcome {
        CohortJobOutcome::Success(success) => {
            cohort.complete(
                success.group_id.clone(),
                success.engine_job_id.clone(),
                success.duration_ms,
            )?;
            if !measure.job_status.is_terminal() {
                measure.complete(
                    success.value,
                    success.computed_at,
                    success.engine_job_id.clone(),
                    success.duration_ms,
                )?;
            }
        }
        CohortJobOutcome::Failure(failure) => {
            cohort.fail(failure.message.clone())?;
            if let Some(engine_job_id) = &failure.engine_job_id {
                cohort.job_handle = Some(engine_job_id.clone());
            }
            cohort.job_duration_ms = failure.duration_ms;
            if !measure.job_status.is_terminal() {
                measure.fail(failure.message.clone())?;
                if let Some(engine_job_id) = &failure.engine_job_id {
                    measure.job_handle = Some(engine_job_id.clone());
                }
                measure.job_duration_ms = failure.duration_ms;
            }
        }
    }
    put_cohort(&db, txn, &cohort)?;
    put_measure(&db, txn, &measure)
}

/// Cancellation write. A terminal record is left untouched; killing a
/// finished or failed job is a no-op rather than an error.
pub(crate) fn kill_job(
    db: Arc<TransactionDB>,
    txn: &Transaction<TransactionDB>,
    req: &KillJobRequest,
) -> Result<()> {
    match &req.record {
        JobRecordRef::Measure(measure_id) => {
            let mut measure = load_measure_for_update(&db, txn, measure_id)?;
            if measure.job_status.is_terminal() {
                return Ok(());
            }
            measure.kill()?;
            put_measure(&db, txn, &measure)
        }
        JobRecordRef::Cohort(cohort_id) => {
            let mut cohort = load_cohort_for_update(&db, txn, cohort_id)?;
            if cohort.job_status.is_terminal() {
                return Ok(());
            }
            cohort.kill()?;
            put_cohort(&db, txn, &cohort)
        }
    }
}
