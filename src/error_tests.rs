use super::*;

#[test]
fn http_status_mapping() {
    assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
    assert_eq!(AppError::object_exist("exists", "dup").http_status(), 409);
    assert_eq!(AppError::credential_invalid("bad_sign", "no").http_status(), 403);
    assert_eq!(AppError::sign_expired("expired", "late").http_status(), 403);
    assert_eq!(AppError::quota_exceeded("quota", "full").http_status(), 413);
    assert_eq!(AppError::not_implemented("ni", "nope").http_status(), 501);
    assert_eq!(AppError::io("io", "io").http_status(), 503);
    assert_eq!(AppError::internal_setting("policy_type", "unknown").http_status(), 500);
}

#[test]
fn wire_codes_follow_taxonomy() {
    assert_eq!(AppError::credential_invalid("c", "m").code_num(), 40001);
    assert_eq!(AppError::upload_failed("c", "m").code_num(), 40002);
    assert_eq!(AppError::quota_exceeded("c", "m").code_num(), 40002);
    assert_eq!(AppError::object_exist("c", "m").code_num(), 40004);
    assert_eq!(AppError::sign_expired("c", "m").code_num(), 40005);
    assert_eq!(AppError::policy_not_allowed("c", "m").code_num(), 40006);
    assert_eq!(AppError::group_not_allowed("c", "m").code_num(), 40007);
    assert_eq!(AppError::io("c", "m").code_num(), 50004);
    assert_eq!(AppError::internal_setting("c", "m").code_num(), 50005);
}

#[test]
fn io_error_kinds_map_to_specific_variants() {
    let nf: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(nf, AppError::NotFound { .. }));
    let ex: AppError = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "there").into();
    assert!(matches!(ex, AppError::ObjectExist { .. }));
    let other: AppError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro").into();
    assert!(matches!(other, AppError::Io { .. }));
}

#[test]
fn wire_code_and_display() {
    let e = AppError::sign_expired("sign_expired", "signature expired");
    assert_eq!(e.code_num(), 40005);
    assert_eq!(e.message(), "signature expired");
    assert_eq!(e.to_string(), "sign_expired: signature expired");
    assert!(e.is_auth_rejection());
    assert!(!AppError::io("io", "x").is_auth_rejection());
}
