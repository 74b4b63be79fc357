use std::fs;
use std::io::{self, Read};

use colored::*;
use crystal_protocol::{DynamicPolicyRecord, StaticPolicyView};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("engine returned {status}: {message}")]
    Engine { status: StatusCode, message: String },
    #[error("could not read rules: {0}")]
    Io(String),
    #[error("{0}")]
    Validation(String),
}

impl From<reqwest::Error> for CliError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct EngineErrorBody {
    code: String,
    message: String,
}

/// Dynamic policy as listed by the engine.
#[derive(Debug, Deserialize)]
pub struct DynamicListing {
    #[serde(flatten)]
    pub record: DynamicPolicyRecord,
    pub running: bool,
}

pub struct CrystalClient {
    base_url: Url,
    http: reqwest::Client,
}

impl CrystalClient {
    pub fn new(base_url: &str) -> Result<Self, CliError> {
        let url = Url::parse(base_url)
            .map_err(|err| CliError::Validation(format!("invalid engine URL: {err}")))?;
        Ok(Self {
            base_url: url,
            http: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CliError> {
        self.base_url
            .join(path)
            .map_err(|err| CliError::Validation(format!("invalid path: {err}")))
    }

    pub async fn health(&self) -> Result<Value, CliError> {
        let response = self.http.get(self.endpoint("/health")?).send().await?;
        parse_response(response).await
    }

    /// Returns the per-line report together with the status, which is
    /// meaningful even when the engine rejected some lines.
    pub async fn deploy(&self, rules: String) -> Result<(StatusCode, Value), CliError> {
        let response = self
            .http
            .post(self.endpoint("/policies")?)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(rules)
            .send()
            .await?;
        let status = response.status();
        let report = response.json::<Value>().await?;
        Ok((status, report))
    }

    pub async fn list_static(&self) -> Result<Vec<StaticPolicyView>, CliError> {
        let response = self.http.get(self.endpoint("/policies/static")?).send().await?;
        parse_response(response).await
    }

    pub async fn list_dynamic(&self) -> Result<Vec<DynamicListing>, CliError> {
        let response = self.http.get(self.endpoint("/policies/dynamic")?).send().await?;
        parse_response(response).await
    }

    pub async fn delete_static(&self, key: &str) -> Result<(), CliError> {
        if !key.contains(':') {
            return Err(CliError::Validation(format!(
                "`{key}` must look like <target>:<policy id>"
            )));
        }
        let url = self.endpoint(&format!("/policies/static/{key}"))?;
        let response = self.http.delete(url).send().await?;
        expect_success(response).await
    }

    pub async fn delete_dynamic(&self, policy_id: u64) -> Result<(), CliError> {
        let url = self.endpoint(&format!("/policies/dynamic/{policy_id}"))?;
        let response = self.http.delete(url).send().await?;
        expect_success(response).await
    }

    pub async fn push_metric(&self, line: &str) -> Result<Value, CliError> {
        let response = self
            .http
            .post(self.endpoint("/metrics")?)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(line.to_string())
            .send()
            .await?;
        parse_response(response).await
    }
}

async fn engine_error(response: reqwest::Response) -> CliError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<EngineErrorBody>(&body) {
        Ok(err) => format!("{} ({})", err.message, err.code),
        Err(_) => body,
    };
    CliError::Engine { status, message }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CliError> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|err| CliError::Http(err.to_string()))
    } else {
        Err(engine_error(response).await)
    }
}

async fn expect_success(response: reqwest::Response) -> Result<(), CliError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(engine_error(response).await)
    }
}

/// Reads rule text from a file, or from stdin when `source` is `-`.
pub fn read_rules(source: &str) -> Result<String, CliError> {
    if source == "-" {
        let mut rules = String::new();
        io::stdin().read_to_string(&mut rules)?;
        return Ok(rules);
    }
    Ok(fs::read_to_string(source)?)
}

pub fn print_deploy_report(status: StatusCode, report: &Value) {
    let headline = if status.is_success() && status != StatusCode::MULTI_STATUS {
        "✔ Rules deployed".green().bold()
    } else if status == StatusCode::MULTI_STATUS {
        "⚠ Rules partially deployed".yellow().bold()
    } else {
        "✖ Deployment rejected".red().bold()
    };
    println!("{} ({})", headline, status);

    let lines = report
        .get("lines")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for line in lines {
        let rule = line.get("rule").and_then(Value::as_str).unwrap_or("?");
        let policies = line
            .get("policies")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().map(Value::to_string).collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        println!("  {}", rule.bold());
        if !policies.is_empty() {
            println!("    policies: {}", policies);
        }
        if let Some(error) = line.get("error").and_then(|err| err.get("message")) {
            println!("    {} {}", "error:".red(), error.as_str().unwrap_or_default());
        }
        for failure in line
            .get("failures")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let target = failure.get("target_id").and_then(Value::as_str).unwrap_or("?");
            let message = failure
                .get("error")
                .and_then(|err| err.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            println!("    {} {}: {}", "failed".yellow(), target, message);
        }
    }
}

pub fn print_static(views: &[StaticPolicyView]) {
    if views.is_empty() {
        println!("No static policies.");
        return;
    }
    println!("{}", "Static policies".bold());
    for view in views {
        println!(
            "  {:>4}  {:<24} {:<16} order={} params={}",
            view.id,
            format!("{} ({})", view.target_name, view.target_id),
            view.entry.filter_name,
            view.entry.execution_order,
            if view.entry.params.is_empty() { "-" } else { view.entry.params.as_str() }
        );
    }
}

pub fn print_dynamic(listings: &[DynamicListing]) {
    if listings.is_empty() {
        println!("No dynamic policies.");
        return;
    }
    println!("{}", "Dynamic policies".bold());
    for listing in listings {
        let record = &listing.record;
        let state = match (record.alive, listing.running) {
            (true, true) => "running".green(),
            (true, false) => "stalled".yellow(),
            (false, _) => "retired".dimmed(),
        };
        println!(
            "  {:>4}  {:<10} {} WHEN {} DO {}{}",
            record.id,
            state,
            record.target_name,
            record.condition_text,
            record.filter_name,
            if record.transient { " TRANSIENT" } else { "" }
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn deploy_returns_report_even_when_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/policies"))
            .and(body_string("TENANT nobody DO SET compress"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "lines": [{
                    "rule": "TENANT nobody DO SET compress",
                    "dynamic": false,
                    "policies": [],
                    "error": { "code": "project_not_found", "message": "project `nobody` does not exist" }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = CrystalClient::new(&server.uri()).unwrap();
        let (status, report) = client
            .deploy("TENANT nobody DO SET compress".into())
            .await
            .unwrap();

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(report["lines"][0]["error"]["code"], "project_not_found");
    }

    #[tokio::test]
    async fn engine_errors_carry_the_message() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/policies/static/t1:9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": "policy_not_found",
                "message": "policy t1:9 not found"
            })))
            .mount(&server)
            .await;

        let client = CrystalClient::new(&server.uri()).unwrap();
        let err = client.delete_static("t1:9").await.unwrap_err();

        match err {
            CliError::Engine { status, message } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert!(message.contains("policy_not_found"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn static_key_without_id_is_rejected_locally() {
        let client = CrystalClient::new("http://127.0.0.1:9").unwrap();
        assert!(matches!(
            client.delete_static("t1").await,
            Err(CliError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn lists_dynamic_policies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/policies/dynamic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": 4,
                "raw_rule_text": "TENANT alice WHEN put_bw > 100 DO SET compress",
                "target_name": "alice",
                "target_id": "t1",
                "filter_name": "compress",
                "action": "SET",
                "action_index": 0,
                "condition_text": "put_bw > 100",
                "transient": false,
                "dispatch_location": "node/monitors/persistent/policy:4",
                "alive": true,
                "running": true
            }])))
            .mount(&server)
            .await;

        let client = CrystalClient::new(&server.uri()).unwrap();
        let listings = client.list_dynamic().await.unwrap();

        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].record.id, 4);
        assert!(listings[0].running);
    }

    #[test]
    fn reads_rules_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "TENANT alice DO SET compress").unwrap();

        let rules = read_rules(file.path().to_str().unwrap()).unwrap();
        assert_eq!(rules.trim(), "TENANT alice DO SET compress");
        assert!(matches!(read_rules("/definitely/missing.rules"), Err(CliError::Io(_))));
    }
}
