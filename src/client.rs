use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use nimbus_core::meta::RequestMeta;
use nimbus_core::nc::{NcClient, NcInstanceReport, NcResourceReport, NcRunRequest};
use serde::de::DeserializeOwned;
use serde_json::json;

/// JSON-over-HTTP node-controller transport.
///
/// Every verb is a POST to `<ncURL>/<verb>` with the request metadata and
/// parameters in the body. Deadlines are enforced by the caller's sandbox,
/// not here; only connection establishment is bounded locally.
pub struct HttpNcClient {
    http: reqwest::Client,
}

impl HttpNcClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build NC HTTP client")?;
        Ok(Self { http })
    }

    async fn post<R: DeserializeOwned>(
        &self,
        url: &str,
        verb: &str,
        body: serde_json::Value,
    ) -> Result<R> {
        let endpoint = format!("{}/{}", url.trim_end_matches('/'), verb);
        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", endpoint))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{} returned {}", endpoint, status);
        }
        response
            .json::<R>()
            .await
            .with_context(|| format!("Unparseable reply from {}", endpoint))
    }

    async fn post_ack(&self, url: &str, verb: &str, body: serde_json::Value) -> Result<()> {
        let _: serde_json::Value = self.post(url, verb, body).await?;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct ConsoleReply {
    output: String,
}

#[async_trait]
impl NcClient for HttpNcClient {
    async fn describe_resource(&self, url: &str, meta: &RequestMeta) -> Result<NcResourceReport> {
        self.post(url, "DescribeResource", json!({ "meta": meta })).await
    }

    async fn describe_instances(
        &self,
        url: &str,
        meta: &RequestMeta,
    ) -> Result<Vec<NcInstanceReport>> {
        self.post(url, "DescribeInstances", json!({ "meta": meta })).await
    }

    async fn run_instance(
        &self,
        url: &str,
        meta: &RequestMeta,
        req: &NcRunRequest,
    ) -> Result<NcInstanceReport> {
        self.post(url, "RunInstance", json!({ "meta": meta, "instance": req }))
            .await
    }

    async fn start_network(&self, url: &str, meta: &RequestMeta, vlan: i32) -> Result<()> {
        self.post_ack(url, "StartNetwork", json!({ "meta": meta, "vlan": vlan }))
            .await
    }

    async fn terminate_instance(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
    ) -> Result<()> {
        self.post_ack(
            url,
            "TerminateInstance",
            json!({ "meta": meta, "instance_id": instance_id }),
        )
        .await
    }

    async fn reboot_instance(&self, url: &str, meta: &RequestMeta, instance_id: &str) -> Result<()> {
        self.post_ack(
            url,
            "RebootInstance",
            json!({ "meta": meta, "instance_id": instance_id }),
        )
        .await
    }

    async fn get_console_output(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
    ) -> Result<String> {
        let reply: ConsoleReply = self
            .post(
                url,
                "GetConsoleOutput",
                json!({ "meta": meta, "instance_id": instance_id }),
            )
            .await?;
        Ok(reply.output)
    }

    async fn attach_volume(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
        volume_id: &str,
        remote_dev: &str,
        local_dev: &str,
    ) -> Result<()> {
        self.post_ack(
            url,
            "AttachVolume",
            json!({
                "meta": meta,
                "instance_id": instance_id,
                "volume_id": volume_id,
                "remote_dev": remote_dev,
                "local_dev": local_dev,
            }),
        )
        .await
    }

    async fn detach_volume(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
        volume_id: &str,
        remote_dev: &str,
        local_dev: &str,
        force: bool,
    ) -> Result<()> {
        self.post_ack(
            url,
            "DetachVolume",
            json!({
                "meta": meta,
                "instance_id": instance_id,
                "volume_id": volume_id,
                "remote_dev": remote_dev,
                "local_dev": local_dev,
                "force": force,
            }),
        )
        .await
    }

    async fn power_down(&self, url: &str, meta: &RequestMeta) -> Result<()> {
        self.post_ack(url, "PowerDown", json!({ "meta": meta })).await
    }
}
