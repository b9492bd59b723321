//! RTP forwarding and RTCP relay tasks.
//!
//! One forwarder per remote track, one RTCP reader per RTP sender. Both
//! select on the owning participant's cancellation token and exit promptly
//! on teardown.

use super::participant::Participant;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

/// Read RTP from `track` and copy each packet to every current subscriber.
///
/// The subscriber list is snapshotted under a short read lock per packet;
/// writes happen outside it. Every write gets its own clone of the packet —
/// the header is copied because the receiving track rewrites the SSRC on
/// the way out, while the payload bytes stay shared. A subscriber whose
/// pipe has closed is removed so the error does not repeat every packet.
pub(crate) fn spawn_forwarder(track: Arc<TrackRemote>, publisher: Arc<Participant>) {
    tokio::spawn(async move {
        let track_id = track.id();
        loop {
            let (packet, _attrs) = tokio::select! {
                _ = publisher.cancel.cancelled() => break,
                result = track.read_rtp() => match result {
                    Ok(read) => read,
                    // Read error means the sender is gone.
                    Err(_) => break,
                },
            };

            let subscribers = publisher.snapshot_subscribers(&track_id).await;
            let mut closed: Vec<Arc<TrackLocalStaticRTP>> = Vec::new();
            for relay in &subscribers {
                let copy = packet.clone();
                if let Err(err) = relay.write_rtp(&copy).await {
                    if err.to_string().contains("closed") {
                        closed.push(Arc::clone(relay));
                    }
                }
            }
            for relay in closed {
                publisher.remove_subscriber(&track_id, &relay).await;
            }
        }
        tracing::debug!(
            user = %publisher.user_id,
            track = %track_id,
            "RTP forwarding ended"
        );
    });
}

/// Read RTCP from a subscriber's RTP sender; when the downstream asks for a
/// keyframe (PLI or FIR), relay a PLI to the original publisher targeted at
/// the source SSRC.
pub(crate) fn spawn_rtcp_listener(
    rtp_sender: Arc<RTCRtpSender>,
    cancel: CancellationToken,
    publisher_pc: Arc<RTCPeerConnection>,
    media_ssrc: u32,
) {
    tokio::spawn(async move {
        loop {
            let packets = tokio::select! {
                _ = cancel.cancelled() => break,
                result = rtp_sender.read_rtcp() => match result {
                    Ok((packets, _attrs)) => packets,
                    Err(_) => break,
                },
            };

            let wants_keyframe = packets.iter().any(|packet| {
                packet
                    .as_any()
                    .downcast_ref::<PictureLossIndication>()
                    .is_some()
                    || packet.as_any().downcast_ref::<FullIntraRequest>().is_some()
            });

            if wants_keyframe {
                if let Err(e) = publisher_pc
                    .write_rtcp(&[Box::new(PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc,
                    })])
                    .await
                {
                    tracing::debug!(error = %e, "PLI relay failed");
                    break;
                }
            }
        }
    });
}
