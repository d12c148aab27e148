//! トランスポートのシナリオテスト

use std::io::Cursor;
use std::net::{TcpListener, TcpStream};
use std::thread;

use remote_display_rs_common::error::ErrorCode;
use remote_display_rs_common::protocol::{
    encode_header, encode_message, split_message, Dispatcher, Message, PacketType, Protocol, ProtocolOptions,
};

/// メッセージを (チャンク番号, フレーム) に分割
fn frames_of(message: Message) -> Vec<(u8, Vec<u8>)> {
    let split = split_message(message, 0);
    let mut frames = Vec::new();
    for (index, blob) in &split.blobs {
        let mut frame = encode_header(blob.len() as u32, 0, *index).to_vec();
        frame.extend_from_slice(blob);
        frames.push((*index, frame));
    }
    let payload = encode_message(&split.message).unwrap();
    let mut frame = encode_header(payload.len() as u32, 0, 0).to_vec();
    frame.extend_from_slice(&payload);
    frames.push((0, frame));
    frames
}

#[test]
fn chunk_order_does_not_matter() {
    let all_bytes: Vec<u8> = (0..=255u8).collect();
    let message = Message::new("draw")
        .with(1u64)
        .with(all_bytes.clone())
        .with("rgb")
        .with(vec![0u8; 300]);
    let frames = frames_of(message.clone());
    let find = |index: u8| frames.iter().find(|(i, _)| *i == index).unwrap().1.clone();
    // ブロブは位置 2 と 4
    assert!(frames.iter().any(|(i, _)| *i == 2));
    assert!(frames.iter().any(|(i, _)| *i == 4));

    let orders: [[u8; 3]; 3] = [[0, 2, 4], [2, 4, 0], [4, 2, 0]];
    for order in orders {
        let stream: Vec<u8> = order.iter().flat_map(|index| find(*index)).collect();
        let mut protocol = Protocol::new(Cursor::new(stream), Vec::new(), ProtocolOptions::default());
        let received = protocol.read_message().unwrap().unwrap();
        assert_eq!(received, message, "順序 {:?}", order);
        assert_eq!(protocol.read_message().unwrap(), None);
    }
}

#[test]
fn ping_over_loopback_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut protocol = Protocol::from_tcp(stream, ProtocolOptions::default()).unwrap();
        let sender = protocol.sender();
        let mut dispatcher: Dispatcher<u32> = Dispatcher::new();
        let hello_sender = sender.clone();
        dispatcher.set_handler(PacketType::Hello, move |_, message| {
            let caps = message.map_arg(1)?;
            hello_sender.apply_peer_capabilities(caps);
            Ok(())
        });
        dispatcher.set_handler(PacketType::Ping, move |pings, message| {
            *pings += 1;
            let echo = PacketType::PingEcho.message().with(message.uint_arg(1)?).with(0u64);
            sender.send(echo)
        });
        let mut pings = 0;
        protocol.run(&mut dispatcher, &mut pings).unwrap();
        pings
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut client = Protocol::from_tcp(stream, ProtocolOptions::default()).unwrap();
    client.send_hello(&["rgb".to_string()]).unwrap();
    for timestamp in [10u64, 20, 30] {
        client.send(PacketType::Ping.message().with(timestamp)).unwrap();
        let echo = client.read_message().unwrap().unwrap();
        assert_eq!(echo.packet_type(), "ping_echo");
        assert_eq!(echo.uint_arg(1).unwrap(), timestamp);
    }
    client.send_disconnect(ErrorCode::Success, "done").unwrap();
    client.shutdown();

    assert_eq!(server.join().unwrap(), 3);
}
