//! Parsing operator-supplied node references.
//!
//! Admin operations accept either a host id or an endpoint address as a
//! string; the other half is resolved against a ring snapshot.

use osprey_common::{Endpoint, HostId, RingError, RingResult};

use crate::metadata::TokenMetadata;

/// Which syntaxes [`HostIdOrEndpoint::parse`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Host id first, endpoint as fallback.
    #[default]
    Auto,
    HostId,
    Endpoint,
}

/// A node reference with at least one half populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdOrEndpoint {
    pub host_id: Option<HostId>,
    pub endpoint: Option<Endpoint>,
}

impl HostIdOrEndpoint {
    /// Parse a node reference. In [`ParseMode::Auto`], a string that is
    /// neither a host id nor an endpoint yields a single
    /// [`RingError::InvalidInput`].
    pub fn parse(s: &str, mode: ParseMode) -> RingResult<Self> {
        let invalid = || RingError::InvalidInput(s.to_string());
        match mode {
            ParseMode::HostId => Ok(Self {
                host_id: Some(s.parse().map_err(|_| invalid())?),
                endpoint: None,
            }),
            ParseMode::Endpoint => Ok(Self {
                host_id: None,
                endpoint: Some(s.parse().map_err(|_| invalid())?),
            }),
            ParseMode::Auto => {
                if let Ok(host_id) = s.parse::<HostId>() {
                    return Ok(Self {
                        host_id: Some(host_id),
                        endpoint: None,
                    });
                }
                let endpoint = s.parse::<Endpoint>().map_err(|_| invalid())?;
                Ok(Self {
                    host_id: None,
                    endpoint: Some(endpoint),
                })
            }
        }
    }

    /// Fill in the missing half from a ring snapshot.
    pub fn resolve(&mut self, tm: &TokenMetadata) -> RingResult<()> {
        match (self.host_id, self.endpoint) {
            (Some(host_id), _) => {
                let endpoint = tm
                    .topology()
                    .endpoint_of(host_id)
                    .ok_or_else(|| RingError::NotInCluster(format!("host id {host_id}")))?;
                self.endpoint = Some(endpoint);
            }
            (None, Some(endpoint)) => {
                let host_id = tm
                    .topology()
                    .host_id_of(endpoint)
                    .ok_or_else(|| RingError::NotInCluster(format!("endpoint {endpoint}")))?;
                self.host_id = Some(host_id);
            }
            (None, None) => {
                osprey_common::on_internal_error("resolve called on an unpopulated node reference")
            }
        }
        Ok(())
    }
}

impl TokenMetadata {
    /// Parse a node reference in auto mode and resolve it against this
    /// snapshot.
    pub fn parse_host_id_and_endpoint(&self, s: &str) -> RingResult<HostIdOrEndpoint> {
        let mut parsed = HostIdOrEndpoint::parse(s, ParseMode::Auto)?;
        parsed.resolve(self)?;
        Ok(parsed)
    }
}
