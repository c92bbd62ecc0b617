//! AWS-backed collaborators: KMS for key wrapping and S3 for objects.

pub mod kms;
pub mod s3;

use aws_config::meta::region::RegionProviderChain;
use aws_types::{region::Region, SdkConfig};
use log::info;

/// Loads an AWS config from default environments.
pub async fn load_config(reg: Option<String>) -> SdkConfig {
    info!("loading AWS configuration for region {:?}", reg);
    let regp = RegionProviderChain::first_try(reg.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-west-2"));

    aws_config::from_env().region(regp).load().await
}
