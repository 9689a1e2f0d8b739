pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{FILE_ID, UPLOAD_ID, chunked_body, failing_body};
