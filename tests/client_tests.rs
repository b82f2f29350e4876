#![no_std]
#![no_main]

mod common;

use heapless::Vec;
use nrf52832_s132_biosig::ble::biosig_service::{
    BIOSIG_MEASUREMENT_CHAR_UUID, BIOSIG_SERVICE_UUID,
};
use nrf52832_s132_biosig::ble::client::{BiosigClient, BiosigClientEvent, ClientError, PeerRecord};
use nrf52832_s132_biosig::ble::events::{
    BleEvent, DiscoveredCharacteristic, DiscoveryResult, ATT_HANDLE_INVALID,
};
use nrf52832_s132_biosig::ble::gatt_queue::{GattOpQueue, GattWriteRequest, QueueError};
use nrf52832_s132_biosig::ble::measurement::{
    encode_frame, MeasurementFrame, SampleTriplet, MAX_BIOSIG_LEN,
};

#[defmt_test::tests]
mod tests {
    use defmt::{assert, assert_eq};

    use super::*;

    fn biosig_discovery(conn_handle: u16) -> DiscoveryResult {
        let mut characteristics = Vec::new();
        characteristics
            .push(DiscoveredCharacteristic {
                uuid16: 0x2A00, // unrelated characteristic ahead of ours
                value_handle: 0x20,
                cccd_handle: ATT_HANDLE_INVALID,
            })
            .unwrap();
        characteristics
            .push(DiscoveredCharacteristic {
                uuid16: BIOSIG_MEASUREMENT_CHAR_UUID,
                value_handle: 0x22,
                cccd_handle: 0x23,
            })
            .unwrap();

        DiscoveryResult {
            conn_handle,
            service_uuid16: BIOSIG_SERVICE_UUID,
            characteristics,
        }
    }

    fn notification(conn_handle: u16, handle: u16) -> BleEvent {
        let mut frame = MeasurementFrame::new(77);
        frame.push(SampleTriplet::new(5, -6, 7));
        let mut buf = [0u8; MAX_BIOSIG_LEN];
        let len = encode_frame(&frame, MAX_BIOSIG_LEN, &mut buf);

        BleEvent::Hvx {
            conn_handle,
            handle,
            data: Vec::from_slice(&buf[..len]).unwrap(),
        }
    }

    #[test]
    fn discovery_populates_invalid_handles() {
        let mut client = BiosigClient::new();
        client.handles_assign(1, None);

        let event = client.on_discovery_complete(&biosig_discovery(1));
        assert!(matches!(event, Some(BiosigClientEvent::DiscoveryComplete { .. })));
        assert_eq!(client.peer().meas_handle, 0x22);
        assert_eq!(client.peer().cccd_handle, 0x23);
    }

    #[test]
    fn explicit_handles_win_over_discovery() {
        let mut client = BiosigClient::new();
        client.handles_assign(
            1,
            Some(PeerRecord { meas_handle: 0x40, cccd_handle: 0x41 }),
        );

        // discovery still reports, but must not clobber the assignment
        let event = client.on_discovery_complete(&biosig_discovery(1));
        assert!(event.is_some());
        assert_eq!(client.peer().meas_handle, 0x40);
        assert_eq!(client.peer().cccd_handle, 0x41);
    }

    #[test]
    fn foreign_service_discovery_is_ignored() {
        let mut client = BiosigClient::new();
        client.handles_assign(1, None);

        let mut result = biosig_discovery(1);
        result.service_uuid16 = 0x180F;

        assert!(client.on_discovery_complete(&result).is_none());
        assert!(!client.peer().is_populated());
    }

    #[test]
    fn notifications_filter_by_connection_and_handle() {
        let mut client = BiosigClient::new();
        client.handles_assign(1, None);
        client.on_discovery_complete(&biosig_discovery(1));

        // foreign link
        assert!(client.on_ble_event(&notification(2, 0x22)).is_none());
        // unrelated characteristic on the right link
        assert!(client.on_ble_event(&notification(1, 0x33)).is_none());

        // matching notification decodes into a measurement
        match client.on_ble_event(&notification(1, 0x22)) {
            Some(BiosigClientEvent::Measurement { conn_handle, measurement }) => {
                assert_eq!(conn_handle, 1);
                assert_eq!(measurement.timestamp, 77);
                assert_eq!(measurement.samples[0], SampleTriplet::new(5, -6, 7));
            }
            _ => defmt::panic!("expected a measurement event"),
        }
    }

    #[test]
    fn disconnect_clears_peer_then_resubscribes_cleanly() {
        let mut client = BiosigClient::new();
        let mut queue = GattOpQueue::new();

        client.handles_assign(1, None);
        client.on_discovery_complete(&biosig_discovery(1));
        client.enable_notifications(&mut queue).unwrap();
        queue.start_next().unwrap();
        queue.on_write_complete(1);

        client.on_ble_event(&BleEvent::Disconnected { conn_handle: 1 });
        assert!(client.conn_handle().is_none());
        assert_eq!(client.peer(), PeerRecord::INVALID);

        // fresh association, rediscovery and subscription all work again
        client.handles_assign(2, None);
        client.on_discovery_complete(&biosig_discovery(2));
        client.enable_notifications(&mut queue).unwrap();
        let request = queue.start_next().unwrap();
        assert_eq!(request.conn_handle, 2);
    }

    #[test]
    fn enable_notifications_enqueues_le_cccd_write() {
        let mut client = BiosigClient::new();
        let mut queue = GattOpQueue::new();

        // parameter validation happens at entry
        assert!(matches!(
            client.enable_notifications(&mut queue),
            Err(ClientError::NoConnection)
        ));

        client.handles_assign(1, None);
        assert!(matches!(
            client.enable_notifications(&mut queue),
            Err(ClientError::InvalidParam)
        ));

        client.on_discovery_complete(&biosig_discovery(1));
        client.enable_notifications(&mut queue).unwrap();

        let request = queue.start_next().unwrap();
        assert_eq!(request.att_handle, 0x23);
        assert_eq!(request.value.as_slice(), &[0x01, 0x00]);

        queue.on_write_complete(1);
        client.disable_notifications(&mut queue).unwrap();
        let request = queue.start_next().unwrap();
        assert_eq!(request.value.as_slice(), &[0x00, 0x00]);
    }

    #[test]
    fn queue_allows_one_outstanding_op_per_connection() {
        let mut queue = GattOpQueue::new();

        let request = |conn: u16, handle: u16| GattWriteRequest {
            conn_handle: conn,
            att_handle: handle,
            value: Vec::from_slice(&[0x01, 0x00]).unwrap(),
        };

        queue.enqueue(request(1, 0x10)).unwrap();
        queue.enqueue(request(1, 0x11)).unwrap();
        queue.enqueue(request(2, 0x20)).unwrap();

        // first op on conn 1 starts; the second must wait for completion,
        // but conn 2 is independent
        assert_eq!(queue.start_next().unwrap().att_handle, 0x10);
        assert_eq!(queue.start_next().unwrap().att_handle, 0x20);
        assert!(queue.start_next().is_none());

        queue.on_write_complete(1);
        assert_eq!(queue.start_next().unwrap().att_handle, 0x11);

        queue.on_write_complete(1);
        queue.on_write_complete(2);
        assert!(queue.is_idle());
    }

    #[test]
    fn queue_bounds_and_disconnect_cleanup() {
        let mut queue = GattOpQueue::new();
        let request = |handle: u16| GattWriteRequest {
            conn_handle: 1,
            att_handle: handle,
            value: Vec::from_slice(&[0x01, 0x00]).unwrap(),
        };

        for i in 0..4 {
            queue.enqueue(request(i)).unwrap();
        }
        assert!(matches!(queue.enqueue(request(99)), Err(QueueError::Full)));

        // everything tied to the dead link goes away, queued and in flight
        let started = queue.start_next().unwrap();
        assert_eq!(started.att_handle, 0);
        queue.on_disconnect(1);
        assert!(queue.is_idle());
    }
}
