//! Print the Website CustomResourceDefinition as YAML.
//!
//! Usage: `crdgen | kubectl apply -f -`

use anyhow::Result;
use cloudself_provisioner::crd::Website;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Website::crd())?);
    Ok(())
}
