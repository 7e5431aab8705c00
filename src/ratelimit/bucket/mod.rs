mod bucket;
mod id;

pub use bucket::BucketSnapshot;
pub use id::BucketId;

pub(crate) use bucket::{Admission, Bucket, CompletionSignal};
pub(crate) use id::BucketKey;
