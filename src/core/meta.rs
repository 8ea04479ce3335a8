//! Request headers attached to every outgoing call.

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::error::{BalancerError, BalancerResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FULL_VERSION: &str = concat!("cluster-balancer/", env!("CARGO_PKG_VERSION"));

pub const HEADER_DATABASE: &str = "x-database";
pub const HEADER_BUILD_INFO: &str = "x-sdk-build-info";
pub const HEADER_APPLICATION_NAME: &str = "x-application-name";
pub const HEADER_TRACE_ID: &str = "x-trace-id";

/// Call metadata derived from the driver configuration
#[derive(Debug, Clone)]
pub struct Meta {
    database: String,
    application_name: Option<String>,
}

impl Meta {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            database: config.database.clone(),
            application_name: config.meta.application_name.clone(),
        }
    }

    /// Return a copy of `ctx` carrying the driver headers.
    ///
    /// Headers the caller already set are kept. A trace id is generated when the
    /// caller did not provide one.
    pub fn context(&self, ctx: &Context) -> BalancerResult<Context> {
        let mut ctx = ctx.clone();
        let metadata = ctx.metadata_mut();

        insert(metadata, HEADER_DATABASE, &self.database)?;
        insert(metadata, HEADER_BUILD_INFO, FULL_VERSION)?;
        if let Some(application_name) = &self.application_name {
            insert(metadata, HEADER_APPLICATION_NAME, application_name)?;
        }
        if !metadata.contains_key(HEADER_TRACE_ID) {
            insert(metadata, HEADER_TRACE_ID, &uuid::Uuid::new_v4().to_string())?;
        }

        Ok(ctx)
    }
}

fn insert(metadata: &mut MetadataMap, key: &'static str, value: &str) -> BalancerResult<()> {
    if metadata.contains_key(key) {
        return Ok(());
    }
    let value: AsciiMetadataValue = value.parse().map_err(|_| BalancerError::InvalidMetadata {
        key: key.to_string(),
        message: format!("value {:?} is not valid ASCII header text", value),
    })?;
    metadata.insert(key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_attached() {
        let mut config = DriverConfig::new("localhost:2135", "/local/db");
        config.meta.application_name = Some("billing".to_string());
        let meta = Meta::new(&config);

        let ctx = meta.context(&Context::background()).unwrap();
        let metadata = ctx.metadata();

        assert_eq!(metadata.get(HEADER_DATABASE).unwrap(), "/local/db");
        assert_eq!(metadata.get(HEADER_BUILD_INFO).unwrap(), FULL_VERSION);
        assert_eq!(metadata.get(HEADER_APPLICATION_NAME).unwrap(), "billing");
        assert!(metadata.contains_key(HEADER_TRACE_ID));
    }

    #[test]
    fn test_caller_headers_win() {
        let meta = Meta::new(&DriverConfig::default());
        let mut ctx = Context::background();
        ctx.metadata_mut().insert(HEADER_TRACE_ID, "trace-1".parse().unwrap());

        let ctx = meta.context(&ctx).unwrap();
        assert_eq!(ctx.metadata().get(HEADER_TRACE_ID).unwrap(), "trace-1");
    }

    #[test]
    fn test_invalid_header_value() {
        let meta = Meta::new(&DriverConfig::new("localhost:2135", "/база"));
        let err = meta.context(&Context::background()).unwrap_err();

        assert!(matches!(err, BalancerError::InvalidMetadata { ref key, .. } if key == HEADER_DATABASE));
    }
}
