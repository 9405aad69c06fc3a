use kube::CustomResourceExt;
use rustrial_k8s_operator_apis::Echo;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Echo::crd()).unwrap());
}
