//! DHCPv4 message dispatch.
//!
//! Bridges parsed packets to the engine: each call takes the inbound
//! request and the in-flight reply and returns `(reply, halt)`, where
//! `halt` tells the embedding handler chain to stop. A `None` reply with
//! `halt` means "answer nothing" (releases, unsupported types).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::packet::{DhcpReply, DhcpRequest, MessageType};
use crate::store::LeaseStore;

pub struct LeaseHandler<S: LeaseStore> {
    engine: Arc<Engine<S>>,
}

impl<S: LeaseStore> LeaseHandler<S> {
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self { engine }
    }

    pub async fn handle(
        &self,
        request: &DhcpRequest,
        reply: DhcpReply,
    ) -> (Option<DhcpReply>, bool) {
        match request.message_type {
            MessageType::Discover => self.handle_discover(request, reply).await,
            MessageType::Request => self.handle_request(request, reply).await,
            MessageType::Release => self.handle_release(request).await,
            other => {
                error!(message_type = %other, hw = %request.hw, "unsupported message type");
                (None, true)
            }
        }
    }

    async fn handle_discover(
        &self,
        request: &DhcpRequest,
        mut reply: DhcpReply,
    ) -> (Option<DhcpReply>, bool) {
        let offered = self
            .engine
            .offer_or_renew(
                request.hw,
                request.requested_ip,
                request.hostname.as_deref(),
                Utc::now(),
            )
            .await;

        match offered {
            Ok(ip) => {
                info!(hw = %request.hw, %ip, "offering address");
                self.fill_reply(&mut reply, ip);
                (Some(reply), false)
            }
            Err(offer_error) => {
                info!(hw = %request.hw, %offer_error, "cannot offer");
                (Some(replace_with_nak(request, &reply, "No available IPs")), true)
            }
        }
    }

    async fn handle_request(
        &self,
        request: &DhcpRequest,
        mut reply: DhcpReply,
    ) -> (Option<DhcpReply>, bool) {
        let confirmed = self
            .engine
            .confirm_or_renew(
                request.hw,
                request.confirmed_ip(),
                request.hostname.as_deref(),
                Utc::now(),
            )
            .await;

        match confirmed {
            Ok(ip) => {
                info!(hw = %request.hw, %ip, "acknowledging address");
                self.fill_reply(&mut reply, ip);
                (Some(reply), false)
            }
            Err(confirm_error) => {
                info!(hw = %request.hw, %confirm_error, "rejecting request");
                (Some(replace_with_nak(request, &reply, "No lease")), true)
            }
        }
    }

    async fn handle_release(&self, request: &DhcpRequest) -> (Option<DhcpReply>, bool) {
        if let Err(release_error) = self.engine.release(request.hw, request.ciaddr).await {
            error!(
                hw = %request.hw,
                ip = %request.ciaddr,
                %release_error,
                "could not release lease"
            );
        }
        (None, true)
    }

    fn fill_reply(&self, reply: &mut DhcpReply, ip: Ipv4Addr) {
        reply.yiaddr = ip;
        reply.lease_time = Some(Duration::from_secs(self.engine.lease_time().as_secs()));
    }
}

/// Builds a NAK for `request`, keeping only the server identifier from the
/// in-flight reply.
fn replace_with_nak(request: &DhcpRequest, in_flight: &DhcpReply, message: &str) -> DhcpReply {
    let server_id = in_flight.server_id;
    if server_id.is_unspecified() {
        warn!("server identifier is unspecified; set it before the lease handler runs");
    }

    let mut nak = DhcpReply::reply_to(request);
    nak.message_type = MessageType::Nak;
    nak.message = Some(message.to_string());
    nak.server_id = server_id;
    nak
}
