//! Performance benchmarks for the decoding and merge paths

use scraper::data_manager::DataManager;
use scraper::query::gamespy::{self, StandardSplitter};
use scraper::query::{quake3, source_engine};
use scraper::sink::NullSink;
use shared::wire::{put_cstring, put_f32_le, put_i32_le, ByteReader};
use shared::{Alias, Score};
use std::sync::Arc;
use std::time::Instant;

/// Benchmarks reassembly of out-of-order GameSpy fragments
#[test]
fn benchmark_gamespy_reassembly() {
    let mut fragments: Vec<Vec<u8>> = (1..=8)
        .map(|n| {
            format!(
                "\\player_{n}\\Player{n}\\frags_{n}\\{n}\\team_{n}\\1\\queryid\\77.{n}"
            )
            .into_bytes()
        })
        .collect();
    fragments.reverse();

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bundle = gamespy::parse_response("info", &fragments, &StandardSplitter).unwrap();
        assert_eq!(bundle.players.len(), 8);
    }

    let duration = start.elapsed();
    println!(
        "GameSpy reassembly: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks Quake3 status parsing with a full server
#[test]
fn benchmark_quake3_status() {
    let mut reply = b"\xFF\xFF\xFF\xFFstatusResponse\n\\sv_hostname\\Bench\\mapname\\q3dm17\n".to_vec();
    for n in 0..32 {
        reply.extend_from_slice(format!("{} 50 \"Player{}\"\n", n, n).as_bytes());
    }

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bundle = quake3::parse_response("status", &reply).unwrap();
        assert_eq!(bundle.players.len(), 32);
    }

    let duration = start.elapsed();
    println!(
        "Quake3 status: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks binary Source player list decoding
#[test]
fn benchmark_source_players() {
    let mut payload = vec![64u8];
    for index in 0..64u8 {
        payload.push(index);
        put_cstring(&mut payload, format!("Player{}", index).as_bytes());
        put_i32_le(&mut payload, index as i32 * 3);
        put_f32_le(&mut payload, 120.5);
    }

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bundle = source_engine::parse_players(&payload).unwrap();
        assert_eq!(bundle.scores.len(), 64);
    }

    let duration = start.elapsed();
    println!(
        "Source players: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks raw primitive reads
#[test]
fn benchmark_wire_reader() {
    let mut buffer = Vec::new();
    for n in 0..1000 {
        put_i32_le(&mut buffer, n);
        put_cstring(&mut buffer, b"key");
    }

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut reader = ByteReader::new(&buffer);
        let mut total = 0i64;
        while !reader.is_empty() {
            total += reader.read_i32_le().unwrap() as i64;
            let _ = reader.read_cstring_bytes().unwrap();
        }
        assert_eq!(total, 499_500);
    }

    let duration = start.elapsed();
    println!(
        "Wire reader: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks repeated merges of an unchanged scoreboard
#[test]
fn benchmark_data_manager_merges() {
    let manager = DataManager::new(Arc::new(NullSink));
    let players: Vec<Alias> = (0..64)
        .map(|n| Alias::new(&n.to_string(), &format!("Player{}", n)))
        .collect();

    let iterations = 200;
    let start = Instant::now();

    for round in 0..iterations {
        for player in &players {
            manager.provide_player_record(player).unwrap();
            manager
                .provide_score_record(&Score::new(player.clone(), round as f32))
                .unwrap();
        }
    }

    let duration = start.elapsed();
    let merges = iterations * players.len() * 2;
    println!(
        "Data manager: {} merges in {:?} ({:.2} μs/merge)",
        merges,
        duration,
        duration.as_micros() as f64 / merges as f64
    );

    assert_eq!(manager.players().len(), 64);
    assert_eq!(manager.scores().len(), 64);
    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}
