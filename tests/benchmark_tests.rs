//! Performance benchmarks for the hot paths of the RCON client

use client::TransmissionTable;
use shared::{checksum, decode, split_response, Packet};
use std::time::{Duration, Instant};

/// Benchmarks encoding of typical command packets
#[test]
fn benchmark_packet_encoding() {
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let bytes = Packet::command((i % 256) as u8, "say -1 Server restart in 5 minutes").encode();
        assert!(bytes.len() > 9);
    }

    let duration = start.elapsed();
    println!(
        "Packet encoding: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration < Duration::from_secs(2));
}

/// Benchmarks decoding including checksum verification
#[test]
fn benchmark_packet_decoding() {
    let encoded = Packet::command(42, &"x".repeat(512)).encode();
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet = decode(&encoded).unwrap();
        assert_eq!(packet.sequence(), Some(42));
    }

    let duration = start.elapsed();
    println!(
        "Packet decoding: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration < Duration::from_secs(3));
}

/// Benchmarks CRC32 throughput on datagram-sized buffers
#[test]
fn benchmark_checksum() {
    let buffer = vec![0xA5u8; 4096];
    let iterations = 10_000;
    let start = Instant::now();

    let mut acc = 0u32;
    for _ in 0..iterations {
        acc ^= checksum(&buffer);
    }

    let duration = start.elapsed();
    let megabytes = (buffer.len() * iterations) as f64 / (1024.0 * 1024.0);
    println!(
        "Checksum: {:.1} MiB in {:?} ({:.1} MiB/s), acc {:08x}",
        megabytes,
        duration,
        megabytes / duration.as_secs_f64(),
        acc
    );

    assert!(duration < Duration::from_secs(2));
}

/// Benchmarks the register/append/complete cycle of the transmission table
#[test]
fn benchmark_transmission_cycle() {
    let table = TransmissionTable::new();
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let sequence = (i % 256) as u8;
        table.register(sequence, None).unwrap();
        assert_eq!(table.append_part(sequence, 2, 1, b"world"), Ok(false));
        assert_eq!(table.append_part(sequence, 2, 0, b"hello "), Ok(true));
        let done = table.complete(sequence).unwrap();
        assert_eq!(done.assembled().len(), 11);
    }

    let duration = start.elapsed();
    println!(
        "Transmission cycle: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(table.is_empty());
    assert!(duration < Duration::from_secs(3));
}

/// Benchmarks splitting and reassembling a large multipart response
#[test]
fn benchmark_multipart_reassembly() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8 + 1).collect();
    let iterations = 100;
    let start = Instant::now();

    for _ in 0..iterations {
        let parts = split_response(7, &payload, 1024).unwrap();
        let table = TransmissionTable::new();
        table.register(7, None).unwrap();

        for packet in parts.iter().rev() {
            let part = packet.multipart().unwrap();
            table
                .append_part(7, part.total, part.index, packet.payload())
                .unwrap();
        }
        assert_eq!(table.complete(7).unwrap().assembled(), payload);
    }

    let duration = start.elapsed();
    println!(
        "Multipart reassembly: {} x {} bytes in {:?}",
        iterations,
        payload.len(),
        duration
    );

    assert!(duration < Duration::from_secs(5));
}
