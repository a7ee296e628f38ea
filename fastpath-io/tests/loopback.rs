use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use fastpath_io::{AddressFamily, RawSocket, Slot, SlotRegion};

fn open_or_skip(family: AddressFamily, protocol: i32) -> Option<RawSocket> {
    match RawSocket::open(family, protocol) {
        Ok(socket) => Some(socket),
        Err(e) if matches!(e.raw_os_error(), libc::EPERM | libc::EACCES | libc::EAFNOSUPPORT) => {
            eprintln!("skipping: raw {} socket unavailable ({})", family, e);
            None
        }
        Err(e) => panic!("raw socket open failed: {}", e),
    }
}

#[test]
fn test_ipv6_batch_over_loopback() {
    let Some(mut sender) = open_or_skip(AddressFamily::Ipv6, 253) else { return };
    let Some(mut receiver) = open_or_skip(AddressFamily::Ipv6, 253) else { return };
    receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    receiver.set_recv_buffer_size(1 << 20).unwrap();

    let slot_size = 256;
    let mut out = vec![0u8; slot_size * 3];
    {
        let mut region = SlotRegion::new(&mut out[..], AddressFamily::Ipv6, slot_size).unwrap();
        for (i, mut slot) in region.iter_mut().enumerate() {
            slot.set_peer(IpAddr::V6(Ipv6Addr::LOCALHOST)).unwrap();
            slot.write_payload(&vec![i as u8 + 1; 10 * (i + 1)]).unwrap();
        }
    }
    assert_eq!(sender.send_batch(&out, 3, slot_size).unwrap(), 3);

    let mut lengths = Vec::new();
    let mut buffer = vec![0u8; slot_size * 8];
    while lengths.len() < 3 {
        let received = receiver.receive_batch(&mut buffer, 8, slot_size).unwrap();
        let region = SlotRegion::new(&buffer[..], AddressFamily::Ipv6, slot_size).unwrap();
        for index in 0..received {
            let slot = region.slot(index).unwrap();
            assert_eq!(slot.peer(), IpAddr::V6(Ipv6Addr::LOCALHOST));
            let marker = slot.data()[0];
            assert!(slot.data().iter().all(|&b| b == marker));
            lengths.push(slot.payload_len());
        }
    }
    assert_eq!(lengths, vec![10, 20, 30]);

    sender.close().unwrap();
    receiver.close().unwrap();
}

#[test]
fn test_ipv4_single_datagram_over_loopback() {
    let Some(sender) = open_or_skip(AddressFamily::Ipv4, 254) else { return };
    let Some(receiver) = open_or_skip(AddressFamily::Ipv4, 254) else { return };
    receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut out = vec![0u8; 128];
    let mut slot = Slot::new(&mut out[..], AddressFamily::Ipv4).unwrap();
    slot.set_peer(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    slot.write_payload(b"fastpath-v4").unwrap();
    assert_eq!(sender.send_one(&out, 11).unwrap(), 11);

    let mut buffer = vec![0u8; 256];
    let received = receiver.receive_one(&mut buffer).unwrap();
    let slot = Slot::new(&buffer[..], AddressFamily::Ipv4).unwrap();
    assert_eq!(slot.peer(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(slot.payload_len() as usize, received);

    // The slot holds the datagram as delivered: IPv4 header, then payload.
    assert_eq!(received, 20 + 11);
    let data = slot.data();
    assert_eq!(data[0], 0x45);
    assert_eq!(data[9], 254);
    assert_eq!(&data[12..16], &[127, 0, 0, 1]);
    assert_eq!(&data[16..20], &[127, 0, 0, 1]);
    assert_eq!(&data[20..], b"fastpath-v4");
    assert_eq!(slot.ip_payload(), b"fastpath-v4");
}

#[test]
fn test_double_close_is_rejected() {
    let Some(mut socket) = open_or_skip(AddressFamily::Ipv6, 253) else { return };
    socket.close().unwrap();
    assert!(socket.is_closed());
    assert!(socket.close().is_err());
    let mut buffer = vec![0u8; 256];
    assert!(socket.receive_batch(&mut buffer, 1, 256).is_err());
}

#[test]
fn test_ipv6_single_datagram_round_trip() {
    let Some(sender) = open_or_skip(AddressFamily::Ipv6, 252) else { return };
    let Some(receiver) = open_or_skip(AddressFamily::Ipv6, 252) else { return };
    receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let payload: Vec<u8> = (0..=255u8).cycle().take(400).collect();
    let mut out = vec![0u8; 72 + payload.len()];
    let mut slot = Slot::new(&mut out[..], AddressFamily::Ipv6).unwrap();
    slot.set_peer(IpAddr::V6(Ipv6Addr::LOCALHOST)).unwrap();
    slot.write_payload(&payload).unwrap();
    assert_eq!(sender.send_one(&out, payload.len()).unwrap(), payload.len());

    let mut buffer = vec![0u8; 1024];
    assert_eq!(receiver.receive_one(&mut buffer).unwrap(), payload.len());
    let slot = Slot::new(&buffer[..], AddressFamily::Ipv6).unwrap();
    assert_eq!(slot.peer(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    assert_eq!(slot.data(), &payload[..]);
    assert!(buffer[..8].iter().all(|&b| b == 0));
}
