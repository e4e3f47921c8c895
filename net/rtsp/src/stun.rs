// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Opportunistic STUN binding discovery (RFC 5389).
//!
//! Before a UDP SETUP we can ask a configured STUN server which public
//! address our RTP socket maps to and advertise that in the Transport
//! header. Symmetric NATs will still defeat this; failure here is never
//! fatal and the SETUP proceeds with the locally bound address.

use std::net::SocketAddr;
use std::time::Duration;

use stun::agent::TransactionId;
use stun::message::{Getter, Message, BINDING_REQUEST};
use stun::xoraddr::XorMappedAddress;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const BINDING_TIMEOUT: Duration = Duration::from_millis(500);

/// Ask `server` for the public mapping of `socket`. Returns `None` on any
/// failure; the caller falls back to the local address.
pub async fn discover_mapped_address(
    socket: &UdpSocket,
    server: SocketAddr,
) -> Option<SocketAddr> {
    match binding_request(socket, server).await {
        Ok(mapped) => {
            debug!(%mapped, %server, "STUN binding discovered");
            Some(mapped)
        }
        Err(err) => {
            debug!(%server, %err, "STUN binding failed, using local address");
            None
        }
    }
}

async fn binding_request(
    socket: &UdpSocket,
    server: SocketAddr,
) -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
    let mut msg = Message::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;

    socket.send_to(&msg.raw, server).await?;

    let mut buf = vec![0u8; 1500];
    let (n, from) = timeout(BINDING_TIMEOUT, socket.recv_from(&mut buf)).await??;
    if from.ip() != server.ip() {
        return Err("binding response from unexpected peer".into());
    }

    let mut response = Message::new();
    response.raw = buf[..n].to_vec();
    response.decode()?;
    if response.transaction_id != msg.transaction_id {
        return Err("transaction id mismatch".into());
    }

    let mut mapped = XorMappedAddress::default();
    mapped.get_from(&response)?;
    Ok(SocketAddr::new(mapped.ip, mapped.port))
}
