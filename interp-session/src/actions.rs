//! Workflow-facing actions on top of a [`SessionRegistry`].
//!
//! Each action returns the name of the workflow transition to take next.
//! Nothing here retries: a failure is recorded in the instance settings and
//! reported as [`transitions::FAILED`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;
use tracing::warn;

use crate::registry::SessionRegistry;
use crate::status::Status;

pub mod transitions {
    /// The command is still running; call `consume_script_output` again.
    pub const RUN: &str = "run";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
}

pub mod keys {
    /// Why the last action failed.
    pub const SM_ERROR_MESSAGE: &str = "SM_ERROR_MESSAGE";
    /// Output of the last successful script, in the line-and-tab layout.
    pub const SCRIPT_OUTPUT: &str = "SCRIPT_OUTPUT";
}

/// Per-instance key/value settings owned by the workflow engine.
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
}

impl Settings for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Produces the final command text for an instance, parameters already
/// substituted. The text must print the sentinel line when it finishes.
#[async_trait]
pub trait ScriptAssembler: Send + Sync {
    async fn assemble(&self, settings: &dyn Settings) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct ScriptActions {
    registry: Arc<SessionRegistry>,
}

impl ScriptActions {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Builds the script for `instance_id` and submits it on a session locked
    /// for that instance.
    pub async fn execute_script(
        &self,
        instance_id: &str,
        settings: &mut dyn Settings,
        assembler: &dyn ScriptAssembler,
    ) -> &'static str {
        let script = match assembler.assemble(&*settings).await {
            Ok(script) => script,
            Err(err) => {
                error!("couldn't build script for {instance_id}: {err:#}");
                return self.fail(instance_id, settings, format!("{err:#}"));
            }
        };

        let Some(session) = self.registry.acquire(instance_id) else {
            return self.fail(
                instance_id,
                settings,
                "no free interpreter session available".to_string(),
            );
        };

        match session.submit(instance_id, script).await {
            Status::Running => transitions::RUN,
            status => self.fail(
                instance_id,
                settings,
                format!("failed to submit script: {status}"),
            ),
        }
    }

    /// Polls the instance's session once and settles the command if it has
    /// finished.
    pub async fn consume_script_output(
        &self,
        instance_id: &str,
        settings: &mut dyn Settings,
    ) -> &'static str {
        let Some(session) = self.registry.session_for(instance_id) else {
            return self.fail(
                instance_id,
                settings,
                "no interpreter session is locked for this instance".to_string(),
            );
        };

        match session.poll(instance_id).await {
            Status::Running => transitions::RUN,
            Status::Success => match session.read_output(instance_id).await {
                Ok(output) => {
                    settings.set(keys::SCRIPT_OUTPUT, output);
                    self.release(instance_id);
                    transitions::SUCCESS
                }
                Err(err) => self.fail(instance_id, settings, err.to_string()),
            },
            Status::ScriptError => {
                let message = match session.read_error_output(instance_id).await {
                    Ok(errors) => format!("script reported errors: {errors}"),
                    Err(err) => err.to_string(),
                };
                self.fail(instance_id, settings, message)
            }
            status => self.fail(
                instance_id,
                settings,
                format!("script did not complete: {status}"),
            ),
        }
    }

    pub fn finalize_operation(&self) -> &'static str {
        transitions::SUCCESS
    }

    fn fail(&self, instance_id: &str, settings: &mut dyn Settings, message: String) -> &'static str {
        warn!("instance {instance_id} failed: {message}");
        settings.set(keys::SM_ERROR_MESSAGE, message);
        self.release(instance_id);
        transitions::FAILED
    }

    fn release(&self, instance_id: &str) {
        if let Err(err) = self.registry.release(instance_id) {
            error!("failed to release session for {instance_id}: {err}");
        }
    }
}
