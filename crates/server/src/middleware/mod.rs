pub mod request_id;

pub use request_id::{BATCH_ID_HEADER, REQUEST_ID_HEADER, RequestId, request_id_middleware};
