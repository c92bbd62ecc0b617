mod command;
mod flags;
mod handlers;

use std::net::{IpAddr, SocketAddr};

use clap::{crate_version, value_parser, Arg, Command};

pub const APP_NAME: &str = "object-encryption-server";

#[tokio::main]
async fn main() {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Serves envelope-encrypted object upload, copy, and re-encrypt demos")
        .arg(
            Arg::new("LOG_LEVEL")
                .long("log-level")
                .short('l')
                .help("Sets the log level")
                .required(false)
                .num_args(1)
                .value_parser(["debug", "info"])
                .default_value("info"),
        )
        .arg(
            Arg::new("HTTP_IP")
                .long("http-ip")
                .help("Sets the HTTP IP to listen on (0.0.0.0 to open to all)")
                .required(false)
                .num_args(1)
                .value_parser(value_parser!(IpAddr))
                .default_value("0.0.0.0"),
        )
        .arg(
            Arg::new("HTTP_PORT")
                .long("port")
                .env("PORT")
                .help("Sets the HTTP port to listen on")
                .required(false)
                .num_args(1)
                .value_parser(value_parser!(u16))
                .default_value("8080"),
        )
        .arg(
            Arg::new("BASE_BUCKET")
                .long("base-bucket")
                .env("OBJECT_ENCRYPTION_BASE_BUCKET")
                .help("Sets the bucket holding plaintext objects (encrypted buckets are derived from it)")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("KMS_KEY_NAME")
                .long("kms-key-name")
                .env("OBJECT_ENCRYPTION_KMS_KEY_NAME")
                .help("Sets the master key that wraps data encryption keys")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("BACKEND")
                .long("backend")
                .help("Sets the key management and object store backend")
                .required(false)
                .num_args(1)
                .value_parser(["aws", "memory"])
                .default_value("aws"),
        )
        .arg(
            Arg::new("REGION")
                .long("region")
                .env("AWS_REGION")
                .help("Sets the AWS region (defaults to the provider chain)")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("SEED_DIR")
                .long("seed-dir")
                .help("Sets the directory whose files preload the base bucket (memory backend only)")
                .required(false)
                .num_args(1),
        )
        .get_matches();

    println!("{} version: {}", APP_NAME, crate_version!());

    let http_ip = *matches
        .get_one::<IpAddr>("HTTP_IP")
        .unwrap_or(&IpAddr::from([0, 0, 0, 0]));
    let http_port = *matches.get_one::<u16>("HTTP_PORT").unwrap_or(&8080);

    command::execute(flags::Options {
        log_level: matches
            .get_one::<String>("LOG_LEVEL")
            .unwrap_or(&String::from("info"))
            .clone(),
        http_host: SocketAddr::new(http_ip, http_port),
        base_bucket: matches
            .get_one::<String>("BASE_BUCKET")
            .unwrap_or(&String::new())
            .clone(),
        kms_key_name: matches
            .get_one::<String>("KMS_KEY_NAME")
            .unwrap_or(&String::new())
            .clone(),
        backend: matches
            .get_one::<String>("BACKEND")
            .unwrap_or(&String::from("aws"))
            .clone(),
        region: matches.get_one::<String>("REGION").cloned(),
        seed_dir: matches.get_one::<String>("SEED_DIR").cloned(),
    })
    .await
    .unwrap();
}
