use modeldeploy::dispatch::{DeployScript, ScriptStep};
use modeldeploy::models::config::{DeploymentConfig, ParameterMap};

use crate::common::REPOSITORY;

fn config(extra: &[(&str, &str)]) -> DeploymentConfig {
    let mut params = ParameterMap::new();
    params.insert("instance-id".into(), "i-0abc123".into());
    params.insert("region".into(), "us-east-1".into());
    params.insert("image-repository".into(), REPOSITORY.into());
    params.insert("hf-token-secret".into(), "secretsmanager:prod/hf-token".into());
    for (key, value) in extra {
        params.insert(key.to_string(), value.to_string());
    }
    DeploymentConfig::from_parameters(&params).unwrap()
}

#[test]
fn test_full_script_order() {
    let config = config(&[("model-id", "meta-llama/Llama-3.1-8B-Instruct")]);
    let script = DeployScript::full(&config, "v7").render();
    let lines = &script.lines;

    assert_eq!(lines[0], "set -eu");
    assert_eq!(
        lines[1],
        "aws ecr get-login-password --region 'us-east-1' | docker login --username AWS --password-stdin '123456789012.dkr.ecr.us-east-1.amazonaws.com'"
    );
    assert_eq!(lines[2], format!("docker pull '{}:v7'", REPOSITORY));
    assert!(lines[3].starts_with("HF_TOKEN=\"$(aws secretsmanager get-secret-value --region 'us-east-1' --secret-id 'prod/hf-token'"));
    assert_eq!(lines[4], "export HF_TOKEN");
    assert_eq!(lines[5], "docker rm -f 'model-server' >/dev/null 2>&1 || true");
    assert_eq!(
        lines[6],
        format!(
            "docker run -d --name 'model-server' --restart unless-stopped --gpus 'all' -p 8000:8000 -e HF_TOKEN -e 'MODEL_ID=meta-llama/Llama-3.1-8B-Instruct' '{}:v7'",
            REPOSITORY
        )
    );
    assert_eq!(lines.len(), 7);
}

#[test]
fn test_quick_restart_script() {
    let config = config(&[("container-name", "vllm")]);
    let script = DeployScript::quick_restart(&config);

    assert_eq!(script.steps(), &[ScriptStep::RestartContainer("vllm".into())]);
    assert_eq!(script.render().lines, vec!["set -eu", "docker restart 'vllm'"]);
}

#[test]
fn test_gpus_none_and_ports() {
    let config = config(&[("gpus", "none"), ("host-port", "80"), ("container-port", "8000")]);
    let body = DeployScript::full(&config, "latest").render().body();

    assert!(!body.contains("--gpus"));
    assert!(body.contains("-p 80:8000"));
}

#[test]
fn test_hostile_values_stay_quoted() {
    let config = config(&[("container-name", "x'; rm -rf / #"), ("model-id", "$(reboot)")]);
    let body = DeployScript::full(&config, "latest").render().body();

    assert!(body.contains(r"--name 'x'\''; rm -rf / #'"));
    assert!(body.contains("-e 'MODEL_ID=$(reboot)'"));
}

#[test]
fn test_only_secret_reference_travels() {
    let config = config(&[("hf-token-secret", "ssm:/models/hf-token")]);
    let script = DeployScript::full(&config, "latest").render();

    let fetch = script
        .lines
        .iter()
        .find(|l| l.starts_with("HF_TOKEN="))
        .unwrap();
    assert!(fetch.contains("aws ssm get-parameter --region 'us-east-1' --name '/models/hf-token' --with-decryption"));
    assert!(script.lines.iter().all(|l| !l.contains("hf_")));
    assert_eq!(script.digest(), DeployScript::full(&config, "latest").render().digest());
}
