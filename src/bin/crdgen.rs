use kube::CustomResourceExt;
use node_maintenance_operator::NodeMaintenance;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&NodeMaintenance::crd())?);
    Ok(())
}
