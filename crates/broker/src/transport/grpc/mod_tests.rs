// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::Request;

use super::GrpcAuthInterceptor;

#[test]
fn shared_secret_header_accepted() {
    let mut interceptor = GrpcAuthInterceptor { secret: "s3cret".to_owned() };
    let mut req = Request::new(());
    req.metadata_mut().insert("x-broker-shared-secret", MetadataValue::from_static("s3cret"));
    assert!(interceptor.call(req).is_ok());
}

#[test]
fn bearer_authorization_accepted() {
    let mut interceptor = GrpcAuthInterceptor { secret: "s3cret".to_owned() };
    let mut req = Request::new(());
    req.metadata_mut().insert("authorization", MetadataValue::from_static("Bearer s3cret"));
    assert!(interceptor.call(req).is_ok());
}

#[test]
fn wrong_secret_rejected() {
    let mut interceptor = GrpcAuthInterceptor { secret: "s3cret".to_owned() };
    let mut req = Request::new(());
    req.metadata_mut().insert("x-broker-shared-secret", MetadataValue::from_static("wrong"));
    assert!(interceptor.call(req).is_err());
}

#[test]
fn missing_metadata_rejected() {
    let mut interceptor = GrpcAuthInterceptor { secret: "s3cret".to_owned() };
    let req = Request::new(());
    assert!(interceptor.call(req).is_err());
}
