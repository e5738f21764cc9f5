//! Shared scripted environment for lifecycle scenarios.

use bivouac::backend::{InstanceSnapshot, InstanceState, MANAGED_BY_TAG, TOKEN_TAG_PREFIX};
use bivouac::identity::EnvironmentIdentity;
use bivouac::lifecycle::{OnExit, RunPlan};
use bivouac::test_support::{SCRIPTED_PUBLIC_IP, ScriptedEnvironment, ScriptedOrchestrator};
use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;

pub const NAME: &str = "bivouac-web-feature-login";
pub const TOKEN: &str = "f00dcafe";

pub struct Harness {
    _tmp: TempDir,
    pub env: ScriptedEnvironment,
}

impl Harness {
    pub fn orchestrator(&self, on_exit: OnExit) -> ScriptedOrchestrator {
        self.env
            .orchestrator(on_exit)
            .unwrap_or_else(|err| panic!("orchestrator: {err}"))
    }
}

#[fixture]
pub fn harness() -> Harness {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
    Harness {
        env: ScriptedEnvironment::new(&root),
        _tmp: tmp,
    }
}

pub fn identity() -> EnvironmentIdentity {
    EnvironmentIdentity::with_token(NAME, TOKEN)
}

pub fn command(command: &str) -> RunPlan {
    RunPlan {
        command: Some(command.to_owned()),
        ..RunPlan::default()
    }
}

pub fn instance(id: &str, state: InstanceState) -> InstanceSnapshot {
    InstanceSnapshot {
        id: id.to_owned(),
        name: NAME.to_owned(),
        zone: String::from("fr-par-1"),
        state,
        public_ip: Some(SCRIPTED_PUBLIC_IP),
        tags: vec![MANAGED_BY_TAG.to_owned(), format!("{TOKEN_TAG_PREFIX}{TOKEN}")],
    }
}
