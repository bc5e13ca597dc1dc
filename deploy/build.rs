/*!

The custom resource definitions are modeled as Rust structs. Here we generate
the corresponding k8s yaml files.

!*/

use kube::CustomResourceExt;
use models::shim::Shim;
use std::env;
use std::fs::{self, File};
use std::path::PathBuf;

const DEPLOY_DIR: &str = env!("CARGO_MANIFEST_DIR");

fn main() {
    // Re-run this build script if the model changes.
    println!("cargo:rerun-if-changed=../models/src");

    let golden = PathBuf::from(DEPLOY_DIR).join("tests").join("golden");
    fs::create_dir_all(&golden).expect("Unable to create golden directory");

    let shim_crd = File::create(golden.join("custom-resource-definition.yaml"))
        .expect("Unable to create CRD file");
    serde_yaml::to_writer(&shim_crd, &Shim::crd()).expect("Unable to write CRD");
}
