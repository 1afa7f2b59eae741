//! Built-in `fs` service.
//!
//! Exposes the calling worker's scoped filesystem. File contents cross the
//! wire base64-encoded so binary files survive JSON transport. Every call
//! runs against the CALLER's root; there is no way to name another
//! worker's files.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;

use super::{ServiceContext, ServiceError, ServiceHandler};

/// Scoped filesystem access for workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsService;

/// One parsed `fs` call.
///
/// Parsing closes over the method table up front; handlers below never
/// switch on raw argument arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FsCall {
    ReadFile { path: String },
    WriteFile { path: String, contents: Vec<u8> },
    Readdir { path: String },
    Stat { path: String },
    Mkdir { path: String },
    Rm { path: String },
    Exists { path: String },
    Unlink { path: String },
}

impl FsCall {
    /// Parse a method name and argument array into a call.
    fn parse(method: &str, args: &[Value]) -> Result<Self, ServiceError> {
        match method {
            "readFile" => Ok(FsCall::ReadFile {
                path: path_arg(method, args)?,
            }),
            "writeFile" => {
                let path = path_arg(method, args)?;
                let encoded = args.get(1).and_then(Value::as_str).ok_or_else(|| {
                    ServiceError::invalid_args(method, "expected base64 contents as second argument")
                })?;
                let contents = BASE64_STANDARD.decode(encoded).map_err(|e| {
                    ServiceError::invalid_args(method, format!("invalid base64 contents: {e}"))
                })?;
                Ok(FsCall::WriteFile { path, contents })
            }
            "readdir" => Ok(FsCall::Readdir {
                path: path_arg(method, args)?,
            }),
            "stat" => Ok(FsCall::Stat {
                path: path_arg(method, args)?,
            }),
            "mkdir" => Ok(FsCall::Mkdir {
                path: path_arg(method, args)?,
            }),
            "rm" => Ok(FsCall::Rm {
                path: path_arg(method, args)?,
            }),
            "exists" => Ok(FsCall::Exists {
                path: path_arg(method, args)?,
            }),
            "unlink" => Ok(FsCall::Unlink {
                path: path_arg(method, args)?,
            }),
            _ => Err(ServiceError::UnknownMethod {
                service: "fs".to_string(),
                method: method.to_string(),
            }),
        }
    }
}

fn path_arg(method: &str, args: &[Value]) -> Result<String, ServiceError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::invalid_args(method, "expected a path string as first argument"))
}

#[async_trait::async_trait]
impl ServiceHandler for FsService {
    async fn call(
        &self,
        ctx: &ServiceContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ServiceError> {
        let call = FsCall::parse(method, args)?;
        let fs = ctx.require_fs()?;
        let value = match call {
            FsCall::ReadFile { path } => {
                let contents = fs.read_file(&path).await?;
                Value::String(BASE64_STANDARD.encode(contents))
            }
            FsCall::WriteFile { path, contents } => {
                fs.write_file(&path, &contents).await?;
                Value::Null
            }
            FsCall::Readdir { path } => {
                let entries = fs.read_dir(&path).await?;
                serde_json::to_value(entries)
                    .map_err(|e| ServiceError::internal(format!("readdir encoding failed: {e}")))?
            }
            FsCall::Stat { path } => {
                let stat = fs.stat(&path).await?;
                serde_json::to_value(stat)
                    .map_err(|e| ServiceError::internal(format!("stat encoding failed: {e}")))?
            }
            FsCall::Mkdir { path } => {
                fs.mkdir(&path).await?;
                Value::Null
            }
            FsCall::Rm { path } => {
                fs.rm(&path).await?;
                Value::Null
            }
            FsCall::Exists { path } => {
                let present = fs.exists(&path).await?;
                Value::Bool(present)
            }
            FsCall::Unlink { path } => {
                fs.unlink(&path).await?;
                Value::Null
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;
    use warren_core::scoped_fs::ScopedFs;
    use warren_core::worker::WorkerId;

    use super::*;

    fn ctx(dir: &TempDir) -> ServiceContext {
        let id = WorkerId::parse("w1").unwrap();
        let fs = ScopedFs::provision(dir.path(), "ws", &id).unwrap();
        ServiceContext::new("w1", Some(fs))
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips_base64() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let payload: Vec<u8> = vec![0x00, 0xFF, 0x42, 0x10];
        let encoded = BASE64_STANDARD.encode(&payload);

        let written = FsService
            .call(&ctx, "writeFile", &[json!("blob.bin"), json!(encoded)])
            .await
            .unwrap();
        assert_eq!(written, Value::Null);

        let read = FsService
            .call(&ctx, "readFile", &[json!("blob.bin")])
            .await
            .unwrap();
        let Value::String(encoded_back) = read else {
            panic!("readFile should return a base64 string, got {read:?}");
        };
        assert_eq!(BASE64_STANDARD.decode(encoded_back).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_readdir_uses_wire_field_names() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        FsService
            .call(&ctx, "mkdir", &[json!("sub")])
            .await
            .unwrap();
        FsService
            .call(
                &ctx,
                "writeFile",
                &[json!("a.txt"), json!(BASE64_STANDARD.encode("hi"))],
            )
            .await
            .unwrap();

        let listing = FsService.call(&ctx, "readdir", &[json!(".")]).await.unwrap();
        let entries = listing.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "a.txt");
        assert_eq!(entries[0]["isFile"], true);
        assert_eq!(entries[1]["name"], "sub");
        assert_eq!(entries[1]["isDirectory"], true);
    }

    #[tokio::test]
    async fn test_stat_directory() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        FsService.call(&ctx, "mkdir", &[json!("d")]).await.unwrap();

        let stat = FsService.call(&ctx, "stat", &[json!("d")]).await.unwrap();
        assert_eq!(stat["isDirectory"], true);
        assert_eq!(stat["isFile"], false);
        assert_ne!(stat["mode"], 0);
    }

    #[tokio::test]
    async fn test_exists_rm_unlink() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        assert_eq!(
            FsService.call(&ctx, "exists", &[json!("x")]).await.unwrap(),
            Value::Bool(false)
        );
        FsService
            .call(
                &ctx,
                "writeFile",
                &[json!("x"), json!(BASE64_STANDARD.encode("1"))],
            )
            .await
            .unwrap();
        assert_eq!(
            FsService.call(&ctx, "exists", &[json!("x")]).await.unwrap(),
            Value::Bool(true)
        );
        FsService.call(&ctx, "unlink", &[json!("x")]).await.unwrap();

        FsService.call(&ctx, "mkdir", &[json!("tree/deep")]).await.unwrap();
        FsService.call(&ctx, "rm", &[json!("tree")]).await.unwrap();
        assert_eq!(
            FsService
                .call(&ctx, "exists", &[json!("tree")])
                .await
                .unwrap(),
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn test_bad_calls_are_service_errors() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);

        let err = FsService.call(&ctx, "chmod", &[json!("x")]).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownMethod { .. }));

        let err = FsService.call(&ctx, "readFile", &[]).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgs { .. }));

        let err = FsService
            .call(&ctx, "writeFile", &[json!("x"), json!("not base64!!")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgs { .. }));

        let err = FsService
            .call(&ctx, "readFile", &[json!("../escape")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Fs(_)));
    }

    #[tokio::test]
    async fn test_missing_filesystem_is_reported() {
        let ctx = ServiceContext::new("gone", None);
        let err = FsService
            .call(&ctx, "readFile", &[json!("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoFilesystem { .. }));
    }
}
