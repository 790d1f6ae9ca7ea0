use std::sync::Arc;

use anyhow::Result;
use data_model::{
    CohortId, CohortResult, DatedMeasure, MeasureId, QuerySnapshot, Request, RequestId,
    SnapshotId,
};
use rocksdb::{Direction, IteratorMode, ReadOptions, TransactionDB};
use serde::de::DeserializeOwned;

use crate::{
    serializer::{JsonEncode, JsonEncoder},
    state_machine::CohortObjectsColumns,
};

pub struct StateReader {
    db: Arc<TransactionDB>,
}

impl StateReader {
    pub fn new(db: Arc<TransactionDB>) -> Self {
        Self { db }
    }

    fn get_row<V>(&self, key: &str, column: CohortObjectsColumns) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow::anyhow!("Failed to get column family {}", column))?;
        match self.db.get_cf(&cf_handle, key)? {
            Some(bytes) => Ok(Some(JsonEncoder::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_rows_from_cf_with_prefix(
        &self,
        key_prefix: &[u8],
        column: CohortObjectsColumns,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow::anyhow!("Failed to get column family {}", column))?;
        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        let iter = self.db.iterator_cf_opt(
            &cf_handle,
            read_options,
            IteratorMode::From(key_prefix, Direction::Forward),
        );
        let mut items = Vec::new();
        for kv in iter {
            let (key, val) = kv?;
            if !key.starts_with(key_prefix) {
                break;
            }
            items.push((key.to_vec(), val.to_vec()));
        }
        Ok(items)
    }

    pub fn get_all_rows_from_cf<V>(
        &self,
        column: CohortObjectsColumns,
    ) -> Result<Vec<(String, V)>>
    where
        V: DeserializeOwned,
    {
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow::anyhow!("Failed to get column family {}", column))?;
        self.db
            .iterator_cf(&cf_handle, IteratorMode::Start)
            .map(|item| {
                let (key, value) = item?;
                let key = String::from_utf8(key.to_vec())?;
                let value = JsonEncoder::decode(&value)?;
                Ok((key, value))
            })
            .collect()
    }

    pub fn get_request(&self, request_id: &RequestId) -> Result<Option<Request>> {
        self.get_row(request_id.get(), CohortObjectsColumns::Requests)
    }

    pub fn get_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Option<QuerySnapshot>> {
        self.get_row(snapshot_id.get(), CohortObjectsColumns::Snapshots)
    }

    pub fn get_measure(&self, measure_id: &MeasureId) -> Result<Option<DatedMeasure>> {
        self.get_row(measure_id.get(), CohortObjectsColumns::Measures)
    }

    pub fn get_cohort(&self, cohort_id: &CohortId) -> Result<Option<CohortResult>> {
        self.get_row(cohort_id.get(), CohortObjectsColumns::Cohorts)
    }

    /// Snapshots of a request, resolved through the per-request index.
    pub fn snapshots_of_request(&self, request_id: &RequestId) -> Result<Vec<QuerySnapshot>> {
        let prefix = format!("{}|", request_id);
        let rows = self.get_rows_from_cf_with_prefix(
            prefix.as_bytes(),
            CohortObjectsColumns::RequestSnapshots,
        )?;
        let mut snapshots = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let key = String::from_utf8(key)?;
            let snapshot_id = key
                .split_once('|')
                .map(|(_, id)| SnapshotId::from(id))
                .ok_or_else(|| anyhow::anyhow!("malformed request snapshot index key: {}", key))?;
            if let Some(snapshot) = self.get_snapshot(&snapshot_id)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Direct children of a snapshot, i.e. the sibling set branch creation
    /// scans.
    pub fn children_of(&self, snapshot_id: &SnapshotId) -> Result<Vec<QuerySnapshot>> {
        let prefix = format!("{}|", snapshot_id);
        let rows = self.get_rows_from_cf_with_prefix(
            prefix.as_bytes(),
            CohortObjectsColumns::SnapshotChildren,
        )?;
        let mut children = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let key = String::from_utf8(key)?;
            let child_id = key
                .split_once('|')
                .map(|(_, id)| SnapshotId::from(id))
                .ok_or_else(|| anyhow::anyhow!("malformed snapshot child index key: {}", key))?;
            if let Some(child) = self.get_snapshot(&child_id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    pub fn active_child_of(&self, snapshot_id: &SnapshotId) -> Result<Option<QuerySnapshot>> {
        Ok(self
            .children_of(snapshot_id)?
            .into_iter()
            .find(|child| child.is_active_branch))
    }

    pub fn saved_snapshot_of(&self, request_id: &RequestId) -> Result<Option<QuerySnapshot>> {
        let cf_handle = self
            .db
            .cf_handle(CohortObjectsColumns::SavedSnapshots.as_ref())
            .ok_or(anyhow::anyhow!("Failed to get column family SavedSnapshots"))?;
        match self.db.get_cf(&cf_handle, request_id.get())? {
            Some(bytes) => {
                let snapshot_id = SnapshotId::new(String::from_utf8(bytes)?);
                self.get_snapshot(&snapshot_id)
            }
            None => Ok(None),
        }
    }

    pub fn measures_of_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Vec<DatedMeasure>> {
        let rows: Vec<(String, DatedMeasure)> =
            self.get_all_rows_from_cf(CohortObjectsColumns::Measures)?;
        Ok(rows
            .into_iter()
            .map(|(_, measure)| measure)
            .filter(|measure| &measure.snapshot_id == snapshot_id)
            .collect())
    }

    pub fn cohorts_of_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Vec<CohortResult>> {
        let rows: Vec<(String, CohortResult)> =
            self.get_all_rows_from_cf(CohortObjectsColumns::Cohorts)?;
        Ok(rows
            .into_iter()
            .map(|(_, cohort)| cohort)
            .filter(|cohort| &cohort.snapshot_id == snapshot_id)
            .collect())
    }

    pub fn cohorts_referencing_measure(&self, measure_id: &MeasureId) -> Result<Vec<CohortId>> {
        let prefix = format!("{}|", measure_id);
        let rows = self.get_rows_from_cf_with_prefix(
            prefix.as_bytes(),
            CohortObjectsColumns::CohortsByMeasure,
        )?;
        rows.into_iter()
            .map(|(key, _)| {
                let key = String::from_utf8(key)?;
                key.split_once('|')
                    .map(|(_, id)| CohortId::from(id))
                    .ok_or_else(|| anyhow::anyhow!("malformed cohort measure index key: {}", key))
            })
            .collect()
    }
}
