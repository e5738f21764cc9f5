//! Interactive choice of the exit policy.

use dialoguer::Select;
use tracing::warn;

use super::OnExit;

/// Asks how to leave the environment at the end of a session.
pub trait ExitPrompt: Send + Sync {
    /// Returns the chosen policy, `default` when no choice is made.
    fn choose(&self, default: OnExit) -> OnExit;
}

/// Prompts on the terminal with an arrow-key menu.
#[derive(Clone, Copy, Debug, Default)]
pub struct DialoguerPrompt;

impl ExitPrompt for DialoguerPrompt {
    fn choose(&self, default: OnExit) -> OnExit {
        let items = [
            "stop (keep disk, credential, and firewall for next time)",
            "terminate (delete everything)",
            "keep running",
        ];
        let default_index = OnExit::ALL
            .iter()
            .position(|policy| *policy == default)
            .unwrap_or_default();
        match Select::new()
            .with_prompt("Session finished; what should happen to the environment?")
            .items(&items)
            .default(default_index)
            .interact_opt()
        {
            Ok(Some(index)) => OnExit::ALL.get(index).copied().unwrap_or(default),
            Ok(None) => default,
            Err(err) => {
                warn!(error = %err, policy = %default, "exit prompt unavailable");
                default
            }
        }
    }
}

/// Always answers with a fixed policy.
#[derive(Clone, Copy, Debug)]
pub struct FixedPrompt(pub OnExit);

impl ExitPrompt for FixedPrompt {
    fn choose(&self, _default: OnExit) -> OnExit {
        self.0
    }
}
