use baton_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/baton.io_batons_crd.yaml",
        serde_yaml::to_string(&Baton::crd()).unwrap(),
    )
    .unwrap();
}
