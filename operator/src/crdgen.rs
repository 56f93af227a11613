use anyhow::Result;
use kube::CustomResourceExt;

use testrun_operator::testrun::TestRun;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&TestRun::crd())?);
    Ok(())
}
