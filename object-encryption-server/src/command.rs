use std::{
    fs,
    io::{self, Error, ErrorKind},
    path::Path,
    sync::Arc,
};

use object_encryption::{
    aws,
    kms::KeyManagementService,
    memory,
    storage::{Encryption, Metadata, ObjectStore},
};

use crate::{flags, handlers};

pub async fn execute(opts: flags::Options) -> io::Result<()> {
    println!("starting {} with {:?}", crate::APP_NAME, opts);

    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, opts.log_level.clone()),
    );

    log::info!("base bucket '{}'", opts.base_bucket);
    log::info!("KMS key name '{}'", opts.kms_key_name);

    let (store, kms): (Arc<dyn ObjectStore>, Arc<dyn KeyManagementService>) =
        match opts.backend.as_str() {
            "aws" => {
                let shared_config = aws::load_config(opts.region.clone()).await;
                let store: Arc<dyn ObjectStore> = Arc::new(aws::s3::Manager::new(&shared_config));
                let kms: Arc<dyn KeyManagementService> =
                    Arc::new(aws::kms::Manager::new(&shared_config));
                (store, kms)
            }
            "memory" => {
                let (store, kms) = memory_backend(&opts).await?;
                let store: Arc<dyn ObjectStore> = store;
                let kms: Arc<dyn KeyManagementService> = kms;
                (store, kms)
            }
            unknown => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown backend '{}'", unknown),
                ));
            }
        };

    let handlers = Arc::new(handlers::Handlers::new(
        store,
        kms,
        &opts.base_bucket,
        &opts.kms_key_name,
    ));

    log::info!("listening on {}", opts.http_host);
    warp::serve(handlers::routes(handlers))
        .run(opts.http_host)
        .await;

    Ok(())
}

/// Creates the in-memory collaborators with every bucket the handlers use.
/// "kms_key_name" becomes the default key of the CMEK bucket, and each file
/// of "seed_dir" is stored into the base bucket under its file name.
async fn memory_backend(
    opts: &flags::Options,
) -> io::Result<(Arc<memory::store::Store>, Arc<memory::kms::Manager>)> {
    let kms = Arc::new(memory::kms::Manager::new());
    kms.create_key(&opts.kms_key_name).map_err(|e| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("failed to create key '{}' ({})", opts.kms_key_name, e),
        )
    })?;

    let store = Arc::new(memory::store::Store::with_kms(kms.clone()));
    store.create_bucket(&opts.base_bucket);
    store.create_bucket(&format!("{}-encrypt1", opts.base_bucket));
    store.create_bucket(&format!("{}-encrypt2", opts.base_bucket));
    store.create_bucket_with_default_key(
        &format!("{}-cmek-encrypt", opts.base_bucket),
        &opts.kms_key_name,
    );

    if let Some(seed_dir) = &opts.seed_dir {
        seed_base_bucket(store.as_ref(), &opts.base_bucket, seed_dir).await?;
    }

    Ok((store, kms))
}

async fn seed_base_bucket(
    store: &memory::store::Store,
    base_bucket: &str,
    seed_dir: &str,
) -> io::Result<usize> {
    log::info!("seeding '{}' from {}", base_bucket, seed_dir);

    if !Path::new(seed_dir).is_dir() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("seed directory {} does not exist", seed_dir),
        ));
    }

    let mut seeded = 0;
    for entry in fs::read_dir(seed_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let object = entry.file_name().to_string_lossy().to_string();
        let data = fs::read(entry.path())?;
        store
            .put_object(
                base_bucket,
                &object,
                &data,
                Encryption::BucketDefault,
                &Metadata::new(),
            )
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

        log::info!("seeded '{}/{}' ({} bytes)", base_bucket, object, data.len());
        seeded += 1;
    }

    Ok(seeded)
}

/// RUST_LOG=debug cargo test --package object-encryption-server --bin object-encryption-server -- command::test_memory_backend --exact --show-output
#[test]
fn test_memory_backend() {
    use std::io::Write;

    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let seed_dir = tempfile::tempdir().unwrap();
    let mut f = fs::File::create(seed_dir.path().join("test-1")).unwrap();
    f.write_all(b"Hello World").unwrap();
    fs::create_dir(seed_dir.path().join("nested")).unwrap();

    let opts = flags::Options {
        log_level: String::from("info"),
        http_host: "127.0.0.1:0".parse().unwrap(),
        base_bucket: String::from("base"),
        kms_key_name: String::from("projects/p/locations/global/keyRings/r/cryptoKeys/k"),
        backend: String::from("memory"),
        region: None,
        seed_dir: Some(seed_dir.path().to_str().unwrap().to_string()),
    };

    let (store, _) = ab!(memory_backend(&opts)).unwrap();
    let (data, attrs) = ab!(store.get_object("base", "test-1", None)).unwrap();
    assert_eq!(data, b"Hello World");
    assert_eq!(attrs.size, 11);
    assert!(ab!(store.get_object("base", "nested", None)).is_err());

    // every derived bucket exists
    for bucket in ["base-encrypt1", "base-encrypt2", "base-cmek-encrypt"] {
        ab!(store.put_object(
            bucket,
            "o",
            b"data",
            Encryption::BucketDefault,
            &Metadata::new()
        ))
        .unwrap();
    }

    let mut missing = opts.clone();
    missing.seed_dir = Some(String::from("/nonexistent/seed/dir"));
    assert!(ab!(memory_backend(&missing)).is_err());

    let mut invalid = opts;
    invalid.kms_key_name = String::from("not-a-key-name");
    invalid.seed_dir = None;
    assert!(ab!(memory_backend(&invalid)).is_err());
}
