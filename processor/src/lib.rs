pub mod dispatcher;
pub mod queue;
pub mod reconciler;
pub mod test_engine;
pub mod worker;
