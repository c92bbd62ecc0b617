use std::sync::Arc;

use log::{info, warn};
use object_encryption::{
    cmek, csek, errors::Result, kms::KeyManagementService, storage::ObjectStore,
};
use serde::Deserialize;
use warp::{http::StatusCode, reply::Response, Filter, Rejection, Reply};

/// Request form shared by all encryption endpoints.
/// A missing "object" reads as empty and fails at the store.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectForm {
    #[serde(default)]
    pub object: String,
}

/// Request handlers with their collaborators and bucket layout.
pub struct Handlers {
    store: Arc<dyn ObjectStore>,
    csek: csek::Service,
    cmek: cmek::Service,
    base_bucket: String,
    kms_key_name: String,
}

impl Handlers {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        kms: Arc<dyn KeyManagementService>,
        base_bucket: &str,
        kms_key_name: &str,
    ) -> Self {
        Self {
            csek: csek::Service::new(store.clone(), kms),
            cmek: cmek::Service::new(store.clone()),
            store,
            base_bucket: base_bucket.to_string(),
            kms_key_name: kms_key_name.to_string(),
        }
    }

    /// Bucket receiving CSEK uploads.
    pub fn csek_encrypt_bucket1(&self) -> String {
        format!("{}-encrypt1", self.base_bucket)
    }

    /// Bucket receiving CSEK copies from "csek_encrypt_bucket1".
    pub fn csek_encrypt_bucket2(&self) -> String {
        format!("{}-encrypt2", self.base_bucket)
    }

    /// Bucket with a default KMS key.
    pub fn cmek_encrypt_bucket(&self) -> String {
        format!("{}-cmek-encrypt", self.base_bucket)
    }

    async fn read_base_object(&self, object: &str) -> Result<Vec<u8>> {
        let (data, _) = self
            .store
            .get_object(&self.base_bucket, object, None)
            .await?;
        Ok(data)
    }

    /// Encrypts an object of the base bucket into "csek_encrypt_bucket1"
    /// under a fresh data encryption key.
    pub async fn csek_upload(&self, object: &str) -> Result<usize> {
        let data = self.read_base_object(object).await?;
        self.csek
            .upload(
                &self.kms_key_name,
                &self.csek_encrypt_bucket1(),
                object,
                &data,
            )
            .await
    }

    pub async fn csek_copy(&self, object: &str) -> Result<()> {
        self.csek
            .copy(
                &self.kms_key_name,
                &self.csek_encrypt_bucket2(),
                &self.csek_encrypt_bucket1(),
                object,
            )
            .await
    }

    /// Uploads an object of the base bucket into "cmek_encrypt_bucket".
    pub async fn cmek_upload(&self, object: &str) -> Result<usize> {
        let data = self.read_base_object(object).await?;
        self.cmek
            .upload(&self.cmek_encrypt_bucket(), object, &data)
            .await
    }

    pub async fn cmek_re_encrypt(&self, object: &str) -> Result<()> {
        self.cmek
            .re_encrypt(&self.cmek_encrypt_bucket(), object)
            .await
    }
}

/// Reads "object" from a urlencoded body, falling back to the query string.
fn object_form() -> impl Filter<Extract = (ObjectForm,), Error = Rejection> + Clone {
    warp::body::content_length_limit(4096)
        .and(warp::body::form::<ObjectForm>())
        .or(warp::query::<ObjectForm>())
        .unify()
}

fn reply_size(op: &str, object: &str, ret: Result<usize>) -> Response {
    match ret {
        Ok(size) => {
            info!("{} '{}' finished ({} bytes)", op, object, size);
            warp::reply::with_status(format!("finish.\nsize={}", size), StatusCode::OK)
                .into_response()
        }
        Err(e) => reply_error(op, object, e),
    }
}

fn reply_finish(op: &str, object: &str, ret: Result<()>) -> Response {
    match ret {
        Ok(()) => {
            info!("{} '{}' finished", op, object);
            warp::reply::with_status("finish.", StatusCode::OK).into_response()
        }
        Err(e) => reply_error(op, object, e),
    }
}

fn reply_error(op: &str, object: &str, e: object_encryption::errors::Error) -> Response {
    warn!("failed {} '{}' ({})", op, object, e);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

pub fn routes(
    handlers: Arc<Handlers>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let handlers = warp::any().map(move || handlers.clone());

    // "/" -> hello
    let index = warp::path::end().map(|| "Hello!\n".into_response());

    let csek_upload = warp::path!("encryption" / "csek" / "upload")
        .and(object_form())
        .and(handlers.clone())
        .then(|form: ObjectForm, h: Arc<Handlers>| async move {
            reply_size("CSEK upload", &form.object, h.csek_upload(&form.object).await)
        });

    let csek_copy = warp::path!("encryption" / "csek" / "copy")
        .and(object_form())
        .and(handlers.clone())
        .then(|form: ObjectForm, h: Arc<Handlers>| async move {
            reply_finish("CSEK copy", &form.object, h.csek_copy(&form.object).await)
        });

    let cmek_upload = warp::path!("encryption" / "cmek" / "upload")
        .and(object_form())
        .and(handlers.clone())
        .then(|form: ObjectForm, h: Arc<Handlers>| async move {
            reply_size("CMEK upload", &form.object, h.cmek_upload(&form.object).await)
        });

    let cmek_re_encrypt = warp::path!("encryption" / "cmek" / "re-encrypt")
        .and(object_form())
        .and(handlers)
        .then(|form: ObjectForm, h: Arc<Handlers>| async move {
            reply_finish(
                "CMEK re-encrypt",
                &form.object,
                h.cmek_re_encrypt(&form.object).await,
            )
        });

    index
        .or(csek_upload)
        .unify()
        .or(csek_copy)
        .unify()
        .or(cmek_upload)
        .unify()
        .or(cmek_re_encrypt)
        .unify()
}

#[cfg(test)]
const TEST_KEY_NAME: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/k";

#[cfg(test)]
fn test_handlers() -> (
    Arc<Handlers>,
    Arc<object_encryption::memory::store::Store>,
    Arc<object_encryption::memory::kms::Manager>,
) {
    use object_encryption::{
        memory,
        storage::{Encryption, Metadata},
    };

    let kms = Arc::new(memory::kms::Manager::new());
    kms.create_key(TEST_KEY_NAME).unwrap();
    let store = Arc::new(memory::store::Store::with_kms(kms.clone()));
    for bucket in ["base", "base-encrypt1", "base-encrypt2"] {
        store.create_bucket(bucket);
    }
    store.create_bucket_with_default_key("base-cmek-encrypt", TEST_KEY_NAME);

    tokio_test::block_on(store.put_object(
        "base",
        "test-1",
        b"Hello World",
        Encryption::BucketDefault,
        &Metadata::new(),
    ))
    .unwrap();

    let handlers = Arc::new(Handlers::new(
        store.clone(),
        kms.clone(),
        "base",
        TEST_KEY_NAME,
    ));
    (handlers, store, kms)
}

#[test]
fn test_hello() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (handlers, _, _) = test_handlers();
    let filter = routes(handlers);

    let resp = ab!(warp::test::request().path("/").reply(&filter));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"Hello!\n");
}

#[test]
fn test_csek_upload_copy() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (handlers, store, kms) = test_handlers();
    let filter = routes(handlers);

    let resp = ab!(warp::test::request()
        .method("POST")
        .path("/encryption/csek/upload")
        .header("content-type", "application/x-www-form-urlencoded")
        .body("object=test-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"finish.\nsize=11");

    let resp = ab!(warp::test::request()
        .path("/encryption/csek/copy?object=test-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"finish.");

    // the copy is only readable with the key unwrapped from its metadata
    assert!(ab!(store.get_object("base-encrypt2", "test-1", None)).is_err());
    let service = csek::Service::new(store, kms);
    let data = ab!(service.download(TEST_KEY_NAME, "base-encrypt2", "test-1")).unwrap();
    assert_eq!(data, b"Hello World");

    let resp = ab!(warp::test::request()
        .path("/encryption/csek/upload?object=missing-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let resp = ab!(warp::test::request()
        .path("/encryption/csek/copy?object=missing-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // no "object" at all
    let resp = ab!(warp::test::request()
        .path("/encryption/csek/upload")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn test_cmek_upload_re_encrypt() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (handlers, store, _) = test_handlers();
    let filter = routes(handlers);

    let resp = ab!(warp::test::request()
        .path("/encryption/cmek/upload?object=test-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"finish.\nsize=11");

    let (_, before) = ab!(store.get_object("base-cmek-encrypt", "test-1", None)).unwrap();

    let resp = ab!(warp::test::request()
        .method("POST")
        .path("/encryption/cmek/re-encrypt")
        .header("content-type", "application/x-www-form-urlencoded")
        .body("object=test-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"finish.");

    let (data, after) = ab!(store.get_object("base-cmek-encrypt", "test-1", None)).unwrap();
    assert_eq!(data, b"Hello World");
    assert_ne!(before.version, after.version);

    let resp = ab!(warp::test::request()
        .path("/encryption/cmek/re-encrypt?object=missing-1")
        .reply(&filter));
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
