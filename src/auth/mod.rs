//! Signed access: one HMAC primitive reused for expiring URLs, upload callbacks and
//! slave request authentication.

pub mod signature;
pub mod request;

pub use signature::{now_unix, sign_fields, verify_fields_at, HmacAuth, SignError};
pub use request::{check_request, check_upload_at, check_url, sign_policy_token, sign_request, sign_url};
