//! Vendor PTZ transports.
//!
//! Every vendor integration conforms to the [`PtzTransport`] trait so the
//! rest of the daemon never probes transport capabilities itself. Two
//! adapters exist: a local ONVIF/SOAP endpoint and a cloud open-platform
//! JSON API. Both convert their wire formats here and nowhere else.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{OurError, OurResult};

/// Capability-limited contract against the physical camera.
///
/// `goto_preset` means "command accepted", not "camera has arrived" — the
/// caller owns the settling wait.
#[async_trait]
pub trait PtzTransport: Send + Sync {
    /// Human-readable transport name, for logs.
    fn describe(&self) -> &str;

    /// All stored presets on the device, token -> display name.
    async fn list_presets(&self) -> OurResult<BTreeMap<String, String>>;

    /// Move the camera to a stored preset.
    async fn goto_preset(&self, token: &str, speed: f32) -> OurResult<()>;

    /// Stop all axes. Transports without a stop primitive return
    /// `OurError::Camera`; the controller substitutes a halt.
    async fn stop(&self) -> OurResult<()>;
}

/// Build the transport selected in the settings.
///
/// Construction never talks to the camera; an unreachable device surfaces
/// later as per-call failures, not as a startup error.
pub fn build_transport(settings: &Settings) -> OurResult<Box<dyn PtzTransport>> {
    match settings.vendor {
        crate::config::CameraVendor::Onvif => {
            let transport = OnvifTransport::new(
                &settings.camera_host,
                settings.camera_port,
                &settings.camera_username,
                &settings.camera_password,
            )?;
            Ok(Box::new(transport))
        }
        crate::config::CameraVendor::Cloud => {
            let app_id = settings
                .cloud_app_id
                .clone()
                .ok_or_else(|| OurError::Config("SKYWATCH_CLOUD_APP_ID is not set".to_string()))?;
            let app_secret = settings.cloud_app_secret.clone().ok_or_else(|| {
                OurError::Config("SKYWATCH_CLOUD_APP_SECRET is not set".to_string())
            })?;
            let device_sn = settings.cloud_device_sn.clone().ok_or_else(|| {
                OurError::Config("SKYWATCH_CLOUD_DEVICE_SN is not set".to_string())
            })?;
            Ok(Box::new(CloudTransport::new(app_id, app_secret, device_sn)?))
        }
    }
}

// ---------------------------------------------------------------------------
// ONVIF
// ---------------------------------------------------------------------------

const ONVIF_TIMEOUT: Duration = Duration::from_secs(10);

/// ONVIF/SOAP adapter talking directly to the camera's PTZ service.
pub struct OnvifTransport {
    client: reqwest::Client,
    media_url: String,
    ptz_url: String,
    username: String,
    password: String,
    /// First media profile token, resolved lazily on first use.
    profile_token: RwLock<Option<String>>,
}

impl OnvifTransport {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> OurResult<Self> {
        let client = reqwest::Client::builder().timeout(ONVIF_TIMEOUT).build()?;
        Ok(Self {
            client,
            media_url: format!("http://{host}:{port}/onvif/media_service"),
            ptz_url: format!("http://{host}:{port}/onvif/ptz_service"),
            username: username.to_string(),
            password: password.to_string(),
            profile_token: RwLock::new(None),
        })
    }

    /// Resolve and cache the camera's first media profile token.
    async fn profile(&self) -> OurResult<String> {
        if let Some(token) = self.profile_token.read().await.clone() {
            return Ok(token);
        }

        let body = soap_envelope(
            r#"<trt:GetProfiles xmlns:trt="http://www.onvif.org/ver10/media/wsdl"/>"#,
        );
        let response = self.soap_call(&self.media_url, &body).await?;

        let profiles = extract_attr_values(&response, "token");
        let token = profiles
            .first()
            .cloned()
            .ok_or_else(|| OurError::Camera("Camera returned no media profiles".to_string()))?;
        info!("Using ONVIF media profile {token}");
        *self.profile_token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn soap_call(&self, url: &str, body: &str) -> OurResult<String> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(OurError::Camera(format!(
                "ONVIF call failed with HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl PtzTransport for OnvifTransport {
    fn describe(&self) -> &str {
        "onvif"
    }

    async fn list_presets(&self) -> OurResult<BTreeMap<String, String>> {
        let profile = self.profile().await?;
        let body = soap_envelope(&format!(
            r#"<tptz:GetPresets xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl"><tptz:ProfileToken>{profile}</tptz:ProfileToken></tptz:GetPresets>"#,
        ));
        let response = self.soap_call(&self.ptz_url, &body).await?;

        let tokens = extract_attr_values(&response, "token");
        let names = extract_tag_texts(&response, "Name");

        let mut presets = BTreeMap::new();
        for (i, token) in tokens.into_iter().enumerate() {
            if token == profile {
                continue;
            }
            let name = names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("Preset {token}"));
            presets.insert(token, name);
        }
        debug!("ONVIF GetPresets returned {} presets", presets.len());
        Ok(presets)
    }

    async fn goto_preset(&self, token: &str, speed: f32) -> OurResult<()> {
        let profile = self.profile().await?;
        let body = soap_envelope(&format!(
            concat!(
                r#"<tptz:GotoPreset xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">"#,
                r#"<tptz:ProfileToken>{profile}</tptz:ProfileToken>"#,
                r#"<tptz:PresetToken>{preset}</tptz:PresetToken>"#,
                r#"<tptz:Speed><tt:PanTilt x="{speed}" y="{speed}"/><tt:Zoom x="{speed}"/></tptz:Speed>"#,
                r#"</tptz:GotoPreset>"#
            ),
            profile = profile,
            preset = token,
            speed = speed,
        ));
        self.soap_call(&self.ptz_url, &body).await?;
        Ok(())
    }

    async fn stop(&self) -> OurResult<()> {
        let profile = self.profile().await?;
        let body = soap_envelope(&format!(
            concat!(
                r#"<tptz:Stop xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl">"#,
                r#"<tptz:ProfileToken>{profile}</tptz:ProfileToken>"#,
                r#"<tptz:PanTilt>true</tptz:PanTilt><tptz:Zoom>true</tptz:Zoom>"#,
                r#"</tptz:Stop>"#
            ),
            profile = profile,
        ));
        self.soap_call(&self.ptz_url, &body).await?;
        Ok(())
    }
}

fn soap_envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">"#,
            r#"<s:Body>{}</s:Body></s:Envelope>"#
        ),
        body
    )
}

/// Pull every `attr="value"` occurrence out of a SOAP response.
///
/// Vendor ONVIF stacks disagree on namespace prefixes, so attribute
/// scanning is more robust here than a schema-aware parse.
fn extract_attr_values(xml: &str, attr: &str) -> Vec<String> {
    let needle = format!("{attr}=\"");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&needle) {
        let after = &rest[start + needle.len()..];
        if let Some(end) = after.find('"') {
            values.push(after[..end].to_string());
            rest = &after[end..];
        } else {
            break;
        }
    }
    values
}

/// Pull the text content of every element whose local name matches `tag`.
fn extract_tag_texts(xml: &str, tag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = xml;
    loop {
        // Opening tags arrive with arbitrary namespace prefixes: <tt:Name>.
        let Some(open) = rest.find(&format!(":{tag}>")) else {
            break;
        };
        let after = &rest[open + tag.len() + 2..];
        let Some(close) = after.find('<') else {
            break;
        };
        let text = after[..close].trim();
        if !text.is_empty() {
            values.push(text.to_string());
        }
        rest = match after[close..].find('>') {
            Some(skip) => &after[close + skip..],
            None => break,
        };
    }
    values
}

// ---------------------------------------------------------------------------
// Cloud open-platform API
// ---------------------------------------------------------------------------

const CLOUD_BASE_URL: &str = "https://openapi.easy4ip.com/openapi";
const CLOUD_TIMEOUT: Duration = Duration::from_secs(15);

/// Imou-style cloud API adapter.
///
/// Presets live server-side as "collections"; moving the camera is a
/// `controlGotoCollection` call against the device serial number.
pub struct CloudTransport {
    client: reqwest::Client,
    app_id: String,
    app_secret: String,
    device_sn: String,
    access_token: RwLock<Option<String>>,
}

impl CloudTransport {
    pub fn new(app_id: String, app_secret: String, device_sn: String) -> OurResult<Self> {
        let client = reqwest::Client::builder().timeout(CLOUD_TIMEOUT).build()?;
        Ok(Self {
            client,
            app_id,
            app_secret,
            device_sn,
            access_token: RwLock::new(None),
        })
    }

    /// Signed system envelope required on every request.
    fn system_envelope(&self) -> Value {
        let time = chrono::Utc::now().timestamp();
        let nonce = uuid::Uuid::new_v4().to_string();
        let sign = format!(
            "{:x}",
            md5::compute(format!(
                "time:{time},nonce:{nonce},appSecret:{}",
                self.app_secret
            ))
        );
        json!({
            "ver": "1.0",
            "appId": self.app_id,
            "sign": sign,
            "time": time,
            "nonce": nonce,
        })
    }

    async fn request(&self, method: &str, params: Value) -> OurResult<Value> {
        let payload = json!({
            "system": self.system_envelope(),
            "id": uuid::Uuid::new_v4().to_string(),
            "params": params,
        });

        let response = self
            .client
            .post(format!("{CLOUD_BASE_URL}/{method}"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OurError::Camera(format!(
                "Cloud API {method} failed with HTTP {status}"
            )));
        }

        let body: Value = response.json().await?;
        let result = body.get("result").cloned().unwrap_or(Value::Null);
        let code = result
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if code != "0" {
            let msg = result
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(OurError::Camera(format!(
                "Cloud API {method} returned code {code}: {msg}"
            )));
        }
        Ok(result.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn access_token(&self) -> OurResult<String> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }

        let data = self.request("accessToken", json!({})).await?;
        let token = data
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| OurError::Camera("accessToken missing from response".to_string()))?
            .to_string();
        *self.access_token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn device_call(&self, method: &str, mut params: Value) -> OurResult<Value> {
        let token = self.access_token().await?;
        if let Some(map) = params.as_object_mut() {
            map.insert("token".to_string(), Value::String(token));
            map.insert(
                "deviceId".to_string(),
                Value::String(self.device_sn.clone()),
            );
            map.insert("channelId".to_string(), Value::String("0".to_string()));
        }
        match self.request(method, params.clone()).await {
            Ok(data) => Ok(data),
            Err(e) => {
                // Expired tokens are the common failure; refresh once.
                warn!("Cloud API {method} failed ({e}), refreshing access token");
                *self.access_token.write().await = None;
                let token = self.access_token().await?;
                if let Some(map) = params.as_object_mut() {
                    map.insert("token".to_string(), Value::String(token));
                }
                self.request(method, params).await
            }
        }
    }
}

#[async_trait]
impl PtzTransport for CloudTransport {
    fn describe(&self) -> &str {
        "cloud"
    }

    async fn list_presets(&self) -> OurResult<BTreeMap<String, String>> {
        let data = self.device_call("getCollection", json!({})).await?;
        let mut presets = BTreeMap::new();

        if let Some(collections) = data.get("collections").and_then(Value::as_array) {
            for collection in collections {
                let Some(id) = value_as_string(collection.get("id")) else {
                    debug!("Skipping collection without an id: {collection}");
                    continue;
                };
                let name = value_as_string(collection.get("name"))
                    .unwrap_or_else(|| format!("Preset {id}"));
                presets.insert(id, name);
            }
        }
        debug!("Cloud getCollection returned {} presets", presets.len());
        Ok(presets)
    }

    async fn goto_preset(&self, token: &str, _speed: f32) -> OurResult<()> {
        // The cloud API has no speed parameter; the device uses its own.
        self.device_call("controlGotoCollection", json!({ "collectionId": token }))
            .await?;
        Ok(())
    }

    async fn stop(&self) -> OurResult<()> {
        // Operation 10 = stop all axes.
        self.device_call(
            "controlMovePTZ",
            json!({ "operation": "10", "duration": "1000" }),
        )
        .await?;
        Ok(())
    }
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
