use faas_controller::api::v1::{Function, Profile};
use kube::CustomResourceExt as _;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Function::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Profile::crd())?);
    Ok(())
}
