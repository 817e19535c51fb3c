//! Typed remote deploy script
//!
//! Scripts are assembled from [`ScriptStep`]s and every interpolated value
//! is single-quoted, so configuration can never inject shell syntax.

use crate::models::command::RemoteScript;
use crate::models::config::{DeploymentConfig, SecretRef};

/// Environment variable the model token is exported under on the target
pub const TOKEN_ENV: &str = "HF_TOKEN";

/// Container settings for a fresh `docker run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub gpus: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub model_id: Option<String>,
}

/// One step of a deploy script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Log docker in to the image registry
    Authenticate { region: String, registry: String },

    /// Pull an image reference
    PullImage(String),

    /// Read the token secret on the target and export it
    FetchSecret { region: String, secret: SecretRef },

    /// Replace the running container with a new one
    RecreateContainer(ContainerSpec),

    /// Restart the existing container in place
    RestartContainer(String),
}

impl ScriptStep {
    fn lines(&self) -> Vec<String> {
        match self {
            ScriptStep::Authenticate { region, registry } => vec![format!(
                "aws ecr get-login-password --region {} | docker login --username AWS --password-stdin {}",
                shell_quote(region),
                shell_quote(registry)
            )],
            ScriptStep::PullImage(image) => vec![format!("docker pull {}", shell_quote(image))],
            ScriptStep::FetchSecret { region, secret } => {
                let read = match secret {
                    SecretRef::SecretsManager(id) => format!(
                        "aws secretsmanager get-secret-value --region {} --secret-id {} --query SecretString --output text",
                        shell_quote(region),
                        shell_quote(id)
                    ),
                    SecretRef::Parameter(name) => format!(
                        "aws ssm get-parameter --region {} --name {} --with-decryption --query Parameter.Value --output text",
                        shell_quote(region),
                        shell_quote(name)
                    ),
                };
                vec![
                    format!("{}=\"$({})\"", TOKEN_ENV, read),
                    format!("export {}", TOKEN_ENV),
                ]
            }
            ScriptStep::RecreateContainer(spec) => {
                let mut run = vec![
                    "docker run -d".to_string(),
                    format!("--name {}", shell_quote(&spec.name)),
                    "--restart unless-stopped".to_string(),
                ];
                if let Some(gpus) = &spec.gpus {
                    run.push(format!("--gpus {}", shell_quote(gpus)));
                }
                run.push(format!("-p {}:{}", spec.host_port, spec.container_port));
                run.push(format!("-e {}", TOKEN_ENV));
                if let Some(model_id) = &spec.model_id {
                    run.push(format!("-e {}", shell_quote(&format!("MODEL_ID={}", model_id))));
                }
                run.push(shell_quote(&spec.image));

                vec![
                    format!("docker rm -f {} >/dev/null 2>&1 || true", shell_quote(&spec.name)),
                    run.join(" "),
                ]
            }
            ScriptStep::RestartContainer(name) => vec![format!("docker restart {}", shell_quote(name))],
        }
    }
}

/// Ordered list of steps rendered into one script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployScript {
    steps: Vec<ScriptStep>,
}

impl DeployScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    /// Login, pull `tag`, fetch the token, recreate the container
    pub fn full(config: &DeploymentConfig, tag: &str) -> Self {
        let image = config.image_ref(tag);
        Self::new()
            .step(ScriptStep::Authenticate {
                region: config.region.clone(),
                registry: config.registry().to_string(),
            })
            .step(ScriptStep::PullImage(image.clone()))
            .step(ScriptStep::FetchSecret {
                region: config.region.clone(),
                secret: config.hf_token_secret.clone(),
            })
            .step(ScriptStep::RecreateContainer(ContainerSpec {
                name: config.container_name.clone(),
                image,
                gpus: config.gpus.clone(),
                host_port: config.host_port,
                container_port: config.container_port,
                model_id: config.model_id.clone(),
            }))
    }

    /// Restart the existing container without pulling
    pub fn quick_restart(config: &DeploymentConfig) -> Self {
        Self::new().step(ScriptStep::RestartContainer(config.container_name.clone()))
    }

    /// Render to channel lines, aborting on the first failing command
    pub fn render(&self) -> RemoteScript {
        let mut lines = vec!["set -eu".to_string()];
        lines.extend(self.steps.iter().flat_map(ScriptStep::lines));
        RemoteScript { lines }
    }
}

/// Single-quote `value` for POSIX sh
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
