//! Endpoint discovery
//!
//! Sorts the endpoints of the bound interface into the three roles the
//! front panel uses. The first endpoint of each role wins; later duplicates
//! are logged and ignored.

use crate::error::{DriverError, EndpointRole, Result};
use common::{EndpointInfo, EndpointKind};
use tracing::{debug, warn};

/// Bulk IN endpoint and the size of the reusable read buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkInEndpoint {
    pub address: u8,
    pub max_packet: usize,
}

/// Interrupt IN endpoint watched by the event monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEndpoint {
    pub address: u8,
    pub max_packet: usize,
}

/// Endpoints of a usable front panel
///
/// Bulk IN and bulk OUT are guaranteed; a panel without an interrupt
/// endpoint simply has no event monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointMap {
    pub bulk_in: BulkInEndpoint,
    pub bulk_out: u8,
    pub interrupt_in: Option<InterruptEndpoint>,
}

/// Classify `endpoints` and build the endpoint map
pub fn discover_endpoints(endpoints: &[EndpointInfo]) -> Result<EndpointMap> {
    let mut bulk_in: Option<BulkInEndpoint> = None;
    let mut bulk_out: Option<u8> = None;
    let mut interrupt_in: Option<InterruptEndpoint> = None;

    for ep in endpoints {
        match ep.kind {
            EndpointKind::BulkIn => match bulk_in {
                None => {
                    bulk_in = Some(BulkInEndpoint {
                        address: ep.address,
                        max_packet: ep.max_packet(),
                    })
                }
                Some(first) => ignore_duplicate("bulk-in", first.address, ep.address),
            },
            EndpointKind::BulkOut => match bulk_out {
                None => bulk_out = Some(ep.address),
                Some(first) => ignore_duplicate("bulk-out", first, ep.address),
            },
            EndpointKind::InterruptIn => match interrupt_in {
                None => {
                    interrupt_in = Some(InterruptEndpoint {
                        address: ep.address,
                        max_packet: ep.max_packet(),
                    })
                }
                Some(first) => ignore_duplicate("interrupt-in", first.address, ep.address),
            },
            EndpointKind::Other => {
                debug!("Ignoring endpoint {:#04x}", ep.address);
            }
        }
    }

    let bulk_in = bulk_in.ok_or(DriverError::EndpointMissing(EndpointRole::BulkIn))?;
    let bulk_out = bulk_out.ok_or(DriverError::EndpointMissing(EndpointRole::BulkOut))?;

    if interrupt_in.is_none() {
        debug!("No interrupt-in endpoint, event monitoring disabled");
    }

    Ok(EndpointMap {
        bulk_in,
        bulk_out,
        interrupt_in,
    })
}

fn ignore_duplicate(role: &str, kept: u8, ignored: u8) {
    warn!(
        "Interface has more than one {} endpoint, keeping {:#04x} and ignoring {:#04x}",
        role, kept, ignored
    );
}
