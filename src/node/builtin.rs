//! Handlers every node registers for itself, chosen by role

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::binary::BinaryFormat;
use crate::dispatch::{DispatcherBuilder, RequestContext};
use crate::ocpp::messages::{
    BinaryDataTransferRequest, BinaryDataTransferResponse, BootNotificationRequest,
    BootNotificationResponse, DataTransferRequest, DataTransferResponse, DataTransferStatus,
    HeartbeatRequest, HeartbeatResponse, RegistrationStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    ChargingStation,
    NetworkingNode,
    Csms,
}

/// Heartbeat interval handed out in BootNotification responses
pub const HEARTBEAT_INTERVAL_SECS: i32 = 300;

pub fn register(builder: DispatcherBuilder, role: NodeRole) -> DispatcherBuilder {
    let builder = builder
        .on::<DataTransferRequest, _, _>(|ctx, request| async move {
            debug!(request_id = %ctx.request_id, vendor_id = %request.vendor_id, "no vendor extension registered");
            Ok(Some(DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
                status_info: None,
                data: None,
                signatures: vec![],
                custom_data: None,
            }))
        })
        .on_binary(BinaryDataTransferRequest::ACTION, binary_data_transfer);

    match role {
        NodeRole::ChargingStation => builder,
        NodeRole::NetworkingNode => builder.on::<HeartbeatRequest, _, _>(|_, _| async { Ok(Some(heartbeat())) }),
        NodeRole::Csms => builder
            .on::<HeartbeatRequest, _, _>(|_, _| async { Ok(Some(heartbeat())) })
            .on::<BootNotificationRequest, _, _>(|ctx, request| async move {
                debug!(
                    request_id = %ctx.request_id,
                    source = ?ctx.source.as_ref().map(|s| s.to_string()),
                    model = %request.charging_station.model,
                    vendor = %request.charging_station.vendor_name,
                    "boot notification"
                );
                Ok(Some(BootNotificationResponse {
                    current_time: Utc::now(),
                    interval: HEARTBEAT_INTERVAL_SECS,
                    status: RegistrationStatus::Accepted,
                    status_info: None,
                    signatures: vec![],
                    custom_data: None,
                }))
            }),
    }
}

async fn binary_data_transfer(ctx: RequestContext, payload: Vec<u8>) -> anyhow::Result<Option<Vec<u8>>> {
    let request = BinaryDataTransferRequest::from_binary(&payload)?;
    debug!(request_id = %ctx.request_id, vendor_id = %request.vendor_id, bytes = request.data.len(), "binary data transfer");
    let response = BinaryDataTransferResponse {
        status: DataTransferStatus::UnknownVendorId,
        additional_info: Some(request.vendor_id),
        data: Vec::new(),
    };
    Ok(Some(response.to_binary(BinaryFormat::Extensible)?))
}

fn heartbeat() -> HeartbeatResponse {
    HeartbeatResponse {
        current_time: Utc::now(),
        signatures: vec![],
        custom_data: None,
    }
}
