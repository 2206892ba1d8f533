// Chunkload - Resumable Encrypted Chunked Transfers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Remote object addressing
//!
//! A [`Location`] names one remote object. Everything the engine decides from
//! the kind of object (cipher, CDN eligibility, random-order saving, artifact
//! names) is a method on the variant.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Descriptor of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// Regular document or media file
    Plain {
        datacenter_id: i32,
        id: i64,
        access_hash: i64,
        file_reference: Vec<u8>,
        volume_id: i64,
        local_id: i32,
    },
    /// End-to-end encrypted document, decrypted with a whole-file key
    Encrypted {
        datacenter_id: i32,
        id: i64,
        access_hash: i64,
        key: [u8; 32],
        iv: [u8; 32],
    },
    /// Profile photo of a peer; `photo_id == 0` until resolved
    PeerPhoto {
        datacenter_id: i32,
        peer_id: i64,
        photo_id: i64,
        big: bool,
        file_reference: Vec<u8>,
    },
    /// Resource proxied from the web
    Web {
        datacenter_id: i32,
        url: String,
        access_hash: i64,
    },
    /// Secure storage document
    Secure {
        datacenter_id: i32,
        id: i64,
        access_hash: i64,
    },
}

impl Location {
    pub fn datacenter_id(&self) -> i32 {
        match self {
            Location::Plain { datacenter_id, .. }
            | Location::Encrypted { datacenter_id, .. }
            | Location::PeerPhoto { datacenter_id, .. }
            | Location::Web { datacenter_id, .. }
            | Location::Secure { datacenter_id, .. } => *datacenter_id,
        }
    }

    /// Check that the descriptor can be sent to a datacenter
    pub fn validate(&self) -> Result<()> {
        if self.datacenter_id() <= 0 {
            return Err(TransferError::invalid_location(format!(
                "datacenter id {} is not addressable",
                self.datacenter_id()
            )));
        }
        match self {
            Location::Web { url, .. } if url.is_empty() => {
                Err(TransferError::invalid_location("web location without url"))
            }
            Location::Plain { id, .. } | Location::Encrypted { id, .. } | Location::Secure { id, .. }
                if *id == 0 =>
            {
                Err(TransferError::invalid_location("location without object id"))
            }
            _ => Ok(()),
        }
    }

    /// Chunks may be requested over a CDN session
    pub fn supports_cdn(&self) -> bool {
        matches!(
            self,
            Location::Plain { .. } | Location::PeerPhoto { .. } | Location::Secure { .. }
        )
    }

    /// Chunks may be written out of order and tracked with a range file
    pub fn allows_random_order(&self) -> bool {
        matches!(
            self,
            Location::Plain { .. } | Location::Web { .. } | Location::Secure { .. }
        )
    }

    pub fn is_web(&self) -> bool {
        matches!(self, Location::Web { .. })
    }

    /// Key and IV of the whole-file cipher
    pub fn whole_file_key(&self) -> Option<(&[u8; 32], &[u8; 32])> {
        match self {
            Location::Encrypted { key, iv, .. } => Some((key, iv)),
            _ => None,
        }
    }

    /// The object has to be resolved before its first request
    pub fn needs_reference(&self) -> bool {
        matches!(self, Location::PeerPhoto { photo_id: 0, .. })
    }

    /// Deterministic stem for every artifact of this object
    pub fn artifact_base_name(&self) -> String {
        match self {
            Location::Plain {
                datacenter_id,
                id,
                volume_id,
                local_id,
                ..
            } => {
                if *volume_id != 0 && *local_id != 0 {
                    format!("{}_{}", volume_id, local_id)
                } else {
                    format!("{}_{}", datacenter_id, id)
                }
            }
            Location::Encrypted { datacenter_id, id, .. } | Location::Secure { datacenter_id, id, .. } => {
                format!("{}_{}", datacenter_id, id)
            }
            Location::PeerPhoto {
                peer_id,
                photo_id,
                big,
                ..
            } => format!("{}_{}_{}", peer_id, photo_id, if *big { "b" } else { "s" }),
            Location::Web { url, .. } => hex::encode(Sha256::digest(url.as_bytes())),
        }
    }

    /// Take over the refreshed reference of the same object
    ///
    /// # Errors
    /// `ReferenceRefreshFailed` if `updated` names a different object
    pub fn apply_refresh(&mut self, updated: Location) -> Result<()> {
        match (&mut *self, updated) {
            (
                Location::Plain { id, file_reference, .. },
                Location::Plain {
                    id: new_id,
                    file_reference: new_reference,
                    ..
                },
            ) if *id == new_id => {
                *file_reference = new_reference;
                Ok(())
            }
            (
                Location::PeerPhoto {
                    peer_id,
                    photo_id,
                    file_reference,
                    ..
                },
                Location::PeerPhoto {
                    peer_id: new_peer,
                    photo_id: new_photo,
                    file_reference: new_reference,
                    ..
                },
            ) if *peer_id == new_peer => {
                *photo_id = new_photo;
                *file_reference = new_reference;
                Ok(())
            }
            (current, updated) => Err(TransferError::ReferenceRefreshFailed(format!(
                "refreshed location {:?} does not match {:?}",
                updated, current
            ))),
        }
    }

    /// Move the object to another datacenter after a migration hint
    pub fn set_datacenter_id(&mut self, dc: i32) {
        match self {
            Location::Plain { datacenter_id, .. }
            | Location::Encrypted { datacenter_id, .. }
            | Location::PeerPhoto { datacenter_id, .. }
            | Location::Web { datacenter_id, .. }
            | Location::Secure { datacenter_id, .. } => *datacenter_id = dc,
        }
    }
}
