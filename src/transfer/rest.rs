//! Request/response transport: one JSON POST per cycle.
//!
//! The request carries the status record plus whatever artifacts are dirty
//! (images base64-encoded). The reply carries the remote command, either
//! bare or inside a `data` envelope.

use super::{Batch, TransferError, Transport};
use crate::config::{StationInfoFile, TransportConfig};
use crate::params::RemoteCommand;
use crate::status::StatusRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;

pub struct ExchangeTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl ExchangeTransport {
    pub fn new(settings: &TransportConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(ExchangeTransport {
            client,
            url: settings.url.clone(),
            api_key: settings.api_key.clone(),
        })
    }
}

impl Transport for ExchangeTransport {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<Option<RemoteCommand>, TransferError> {
        let payload = Payload::from(batch);
        let response = self
            .client
            .post(&self.url)
            .header("x-functions-key", &self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        debug!("Collector replied with {} bytes", body.len());
        parse_response(&body)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Payload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    station_info: Option<WireStationInfo<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    img_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    img_detail: Option<String>,
    status: &'a StatusRecord,
}

impl<'a> From<&'a Batch> for Payload<'a> {
    fn from(batch: &'a Batch) -> Self {
        Payload {
            station_info: batch.station_info.as_ref().map(WireStationInfo::from),
            img_total: batch.total.as_ref().map(|b| STANDARD.encode(b)),
            img_detail: batch.detail.as_ref().map(|b| STANDARD.encode(b)),
            status: &batch.status,
        }
    }
}

#[derive(Serialize)]
struct WireStationInfo<'a> {
    header: WireHeader<'a>,
    info: WireInfo<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireHeader<'a> {
    id_name: &'a str,
    id_no: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInfo<'a> {
    name: &'a str,
    location: &'a str,
    latitude: f64,
    longitude: f64,
    #[serde(rename = "typeWebCam")]
    type_webcam: &'a str,
    type_transfer: &'a str,
    text: &'a str,
    website: &'a str,
    team: &'a str,
    nearby_public_inst: &'a str,
    organization: &'a str,
}

impl<'a> From<&'a StationInfoFile> for WireStationInfo<'a> {
    fn from(file: &'a StationInfoFile) -> Self {
        let i = &file.info;
        WireStationInfo {
            header: WireHeader {
                id_name: &file.header.id_name,
                id_no: &file.header.id_no,
            },
            info: WireInfo {
                name: &i.name,
                location: &i.location,
                latitude: i.latitude,
                longitude: i.longitude,
                type_webcam: &i.type_webcam,
                type_transfer: &i.type_transfer,
                text: &i.text,
                website: &i.website,
                team: &i.team,
                nearby_public_inst: &i.nearby_public_inst,
                organization: &i.organization,
            },
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    data: Option<Reply>,
    #[serde(flatten)]
    bare: Option<Reply>,
}

#[derive(Deserialize)]
struct Reply {
    command: WireCommand,
    #[serde(default)]
    detail: WireDetail,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommand {
    #[serde(deserialize_with = "flag")]
    cam_offline: bool,
    period_m: u32,
    #[serde(deserialize_with = "flag")]
    series: bool,
    #[serde(deserialize_with = "flag")]
    zoom_move: bool,
    #[serde(deserialize_with = "flag")]
    zoom_draw_rect: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireDetail {
    zoom_cent_perc_x: i32,
    zoom_cent_perc_y: i32,
}

/// Accepts `true`/`false` as well as `1`/`0`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Extract the remote command. A reply without one means "no command".
fn parse_response(body: &[u8]) -> Result<Option<RemoteCommand>, TransferError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| TransferError::Decode(e.to_string()))?;
    Ok(envelope.data.or(envelope.bare).map(|reply| RemoteCommand {
        cam_offline: reply.command.cam_offline,
        period_m: reply.command.period_m,
        series: reply.command.series,
        zoom_move: reply.command.zoom_move,
        zoom_draw_rect: reply.command.zoom_draw_rect,
        zoom_center_perc_x: reply.detail.zoom_cent_perc_x,
        zoom_center_perc_y: reply.detail.zoom_cent_perc_y,
    }))
}
