pub mod candle_folder;
pub mod snapshot_store;

pub use candle_folder::bucket_start;
pub use snapshot_store::SnapshotStore;
