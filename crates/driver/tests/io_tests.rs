//! Bulk transfer and vendor command integration tests
//!
//! # Test Scenarios
//! - Read sizing against the endpoint's max packet size
//! - Writers on one session never interleave on the wire
//! - GetStatus / SetActuator wire shape and error mapping
//! - Numbered command dispatch
//!
//! Run with: `cargo test -p xserve-fp --test io_tests`

use byteorder::{ByteOrder, NativeEndian};
use common::test_utils::{
    SIM_BULK_PACKET, SimulatedFrontPanel, endpoint, fill_pattern, front_panel_endpoints,
};
use common::{BusLocation, EndpointKind, front_panel};
use std::sync::Arc;
use std::time::Duration;
use xserve_fp::{
    AttachRequest, Driver, DriverConfig, DriverError, GET_STATUS, SET_ACTUATOR, SessionHandle,
};

async fn attach(panel: &Arc<SimulatedFrontPanel>) -> (Driver, SessionHandle) {
    let mut config = DriverConfig::default();
    config.monitor.enabled = false;
    let driver = Driver::new(&config);

    let minor = driver
        .attach(AttachRequest {
            vendor_id: front_panel::VENDOR_ID,
            product_id: front_panel::PRODUCT_ID,
            location: BusLocation { bus: 2, address: 3 },
            endpoints: front_panel_endpoints(),
            transport: panel.clone(),
        })
        .await
        .unwrap();
    let handle = driver.open(minor).unwrap();
    (driver, handle)
}

// ============================================================================
// Bulk Transfers
// ============================================================================

mod bulk {
    use super::*;

    #[tokio::test]
    async fn test_read_never_exceeds_max_packet() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.queue_bulk_in(fill_pattern(0x11, 200));
        let (_driver, handle) = attach(&panel).await;

        let data = handle.read(4096).await.unwrap();
        assert_eq!(data.len(), usize::from(SIM_BULK_PACKET));
    }

    #[tokio::test]
    async fn test_read_never_exceeds_request() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.queue_bulk_in(fill_pattern(0x22, 64));
        let (_driver, handle) = attach(&panel).await;

        let data = handle.read(10).await.unwrap();
        assert_eq!(data, fill_pattern(0x22, 10));
    }

    #[tokio::test]
    async fn test_short_read_is_returned_as_is() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.queue_bulk_in(vec![7, 8]);
        let (_driver, handle) = attach(&panel).await;

        assert_eq!(handle.read(64).await.unwrap(), vec![7, 8]);
        assert_eq!(panel.bulk_transfers(), 1);
    }

    #[tokio::test]
    async fn test_large_max_packet_is_masked() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.queue_bulk_in(fill_pattern(0x33, 2048));

        let mut config = DriverConfig::default();
        config.monitor.enabled = false;
        let driver = Driver::new(&config);
        let minor = driver
            .attach(AttachRequest {
                vendor_id: front_panel::VENDOR_ID,
                product_id: front_panel::PRODUCT_ID,
                location: BusLocation { bus: 2, address: 3 },
                endpoints: vec![
                    endpoint(0x81, EndpointKind::BulkIn, 0x1200),
                    endpoint(0x02, EndpointKind::BulkOut, 512),
                ],
                transport: panel.clone(),
            })
            .await
            .unwrap();

        let data = driver.open(minor).unwrap().read(4096).await.unwrap();
        assert_eq!(data.len(), 512);
    }

    #[tokio::test]
    async fn test_zero_length_read_skips_bus() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        assert!(handle.read(0).await.unwrap().is_empty());
        assert_eq!(panel.bulk_transfers(), 0);
    }

    #[tokio::test]
    async fn test_read_into_caller_buffer() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.queue_bulk_in(vec![1, 2, 3, 4, 5, 6]);
        let (_driver, handle) = attach(&panel).await;

        let mut buf = [0u8; 4];
        assert_eq!(handle.read_into(&mut buf).await.unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_read_errors_carry_bus_status() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.fail_bulk_in(rusb::Error::Pipe);
        let (_driver, handle) = attach(&panel).await;

        assert!(matches!(
            handle.read(8).await,
            Err(DriverError::TransferFailed(rusb::Error::Pipe))
        ));
        // Empty queue: the device never answers.
        let err = handle.read(8).await.unwrap_err();
        assert!(matches!(err, DriverError::TransferFailed(rusb::Error::Timeout)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_write_returns_accepted_bytes() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        assert_eq!(handle.write(b"front panel").await.unwrap(), 11);
        assert_eq!(panel.received(), b"front panel");

        panel.set_write_limit(4);
        assert_eq!(handle.write(b"partial").await.unwrap(), 4);
        assert_eq!(panel.bulk_transfers(), 2);
    }

    #[tokio::test]
    async fn test_empty_write_skips_bus() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        assert_eq!(handle.write(&[]).await.unwrap(), 0);
        assert_eq!(panel.bulk_transfers(), 0);
    }

    #[tokio::test]
    async fn test_write_failure() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.fail_writes(rusb::Error::NoDevice);
        let (_driver, handle) = attach(&panel).await;

        assert!(matches!(
            handle.write(b"abc").await,
            Err(DriverError::TransferFailed(rusb::Error::NoDevice))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_interleave() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.set_write_pacing(Duration::from_millis(2));
        let (driver, first) = attach(&panel).await;
        let second = driver.open(first.minor()).unwrap();

        let writers: Vec<_> = [(first, 0xaa_u8), (second, 0x55)]
            .into_iter()
            .map(|(handle, byte)| {
                tokio::spawn(async move { handle.write(&fill_pattern(byte, 64)).await })
            })
            .collect();
        for writer in writers {
            assert_eq!(writer.await.unwrap().unwrap(), 64);
        }

        let received = panel.received();
        assert_eq!(received.len(), 128);
        for half in received.chunks(64) {
            assert!(
                half.iter().all(|b| *b == half[0]),
                "writes interleaved: {:02x?}",
                received
            );
        }
        assert_ne!(received[0], received[64]);
    }
}

// ============================================================================
// Vendor Commands
// ============================================================================

mod commands {
    use super::*;

    #[tokio::test]
    async fn test_set_actuator_then_get_status() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        handle.set_actuator(127).await.unwrap();
        assert_eq!(handle.get_status().await.unwrap(), 127);
        assert_eq!(panel.actuator(), 127);
    }

    #[tokio::test]
    async fn test_control_wire_shape() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        handle.set_actuator(127).await.unwrap();
        handle.get_status().await.unwrap();

        let log = panel.control_log();
        assert_eq!(log.len(), 2);

        let set = &log[0];
        assert_eq!(set.request_type(), 0x40);
        assert_eq!(set.request(), 0x02);
        assert_eq!(set.value(), 127);
        assert_eq!(set.index(), 0);
        assert_eq!(set.length(), 0);
        assert!(set.data.is_empty());

        let get = &log[1];
        assert_eq!(get.request_type(), 0xc0);
        assert_eq!(get.request(), 0x01);
        assert_eq!(get.value(), 0);
        assert_eq!(get.index(), 0);
        assert_eq!(get.length(), 4);
    }

    #[tokio::test]
    async fn test_negative_actuator_value() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        handle.set_actuator(-2).await.unwrap();
        assert_eq!(panel.actuator(), 0xfffe);
        assert_eq!(handle.get_status().await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_out_of_range_actuator_rejected_before_bus() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        assert!(matches!(
            handle.set_actuator(70_000).await,
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(panel.control_log().is_empty());
    }

    #[tokio::test]
    async fn test_short_status_fails() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.truncate_status(2);
        let (_driver, handle) = attach(&panel).await;

        assert!(matches!(
            handle.get_status().await,
            Err(DriverError::CommandFailed {
                command: "GetStatus",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_command_errors_carry_bus_status() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        panel.fail_controls(rusb::Error::Timeout);
        let (_driver, handle) = attach(&panel).await;

        assert!(matches!(
            handle.get_status().await,
            Err(DriverError::CommandFailed {
                command: "GetStatus",
                status: rusb::Error::Timeout
            })
        ));
        assert!(matches!(
            handle.set_actuator(5).await,
            Err(DriverError::CommandFailed {
                command: "SetActuator",
                status: rusb::Error::Timeout
            })
        ));
    }

    #[tokio::test]
    async fn test_numbered_commands() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        let mut arg = [0u8; 4];
        NativeEndian::write_i32(&mut arg, 300);
        handle.control(SET_ACTUATOR, &mut arg).await.unwrap();
        assert_eq!(panel.actuator(), 300);

        let mut arg = [0u8; 4];
        handle.control(GET_STATUS, &mut arg).await.unwrap();
        assert_eq!(NativeEndian::read_i32(&arg), 300);
    }

    #[tokio::test]
    async fn test_numbered_command_argument_checks() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let (_driver, handle) = attach(&panel).await;

        let mut short = [0u8; 2];
        assert!(matches!(
            handle.control(GET_STATUS, &mut short).await,
            Err(DriverError::BoundaryFault {
                expected: 4,
                actual: 2
            })
        ));

        let mut arg = [0u8; 4];
        assert!(matches!(
            handle.control(0x8004_5899, &mut arg).await,
            Err(DriverError::UnsupportedCommand(0x8004_5899))
        ));
        assert!(panel.control_log().is_empty());
    }
}
