//! Integration tests for the scraper components
//!
//! These tests run the codecs, the RCON client and the data manager against
//! fake game servers on loopback sockets.

use assert_approx_eq::assert_approx_eq;
use scraper::data_manager::DataManager;
use scraper::query::{
    GameSpyCodec, IdTech4Codec, QueryClient, QueryCodec, Quake3Codec, SourceEngineCodec,
    UdpTransport,
};
use scraper::sink::CaptureSink;
use shared::wire::{put_cstring, put_f32_le, put_i32_le};
use shared::{Alias, QueryResultBundle, Score, UpdateContent};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Starts a UDP server answering each request with the datagrams `respond` returns.
///
/// The server thread exits after a few seconds without requests.
fn spawn_udp_server<F>(respond: F) -> SocketAddr
where
    F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind server socket");
    let addr = socket.local_addr().unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buf) {
            for datagram in respond(&buf[..len]) {
                let _ = socket.send_to(&datagram, peer);
            }
        }
    });
    addr
}

fn with_header(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut data = header.to_vec();
    data.extend_from_slice(body);
    data
}

/// QUERY PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Fragments sent in reverse order must still be parsed fragment 1 first
    #[tokio::test]
    async fn gamespy_reassembles_reversed_fragments() {
        let addr = spawn_udp_server(|request| {
            assert_eq!(request, b"\\info\\");
            vec![
                b"\\player_1\\Second\\frags_1\\7\\queryid\\29.2\\final\\".to_vec(),
                b"\\hostname\\Battle Arena\\mapname\\el_alamein\\player_0\\First\\frags_0\\21\\queryid\\29.1"
                    .to_vec(),
            ]
        });

        let transport = UdpTransport::connect(&addr.to_string()).await.unwrap();
        let mut codec = GameSpyCodec::new(transport);
        let bundle = codec.query("info").await.expect("Expected a bundle");

        let metadata = bundle.server_metadata.as_ref().unwrap();
        assert_eq!(metadata.server_name.as_deref(), Some("Battle Arena"));
        assert_eq!(bundle.round.as_ref().unwrap().map.as_deref(), Some("el_alamein"));

        let names: Vec<&str> = bundle.players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second"]);
        assert_approx_eq!(bundle.scores[0].score, 21.0);

        let raw = bundle.raw_response.unwrap();
        assert!(raw.starts_with("\\hostname\\Battle Arena"));
        assert!(raw.ends_with("\\final\\"));
    }

    /// Every field of a constructed info reply survives parsing unchanged
    #[tokio::test]
    async fn source_engine_info_round_trip() {
        let addr = spawn_udp_server(|request| {
            assert_eq!(&request[..5], &[0xFF, 0xFF, 0xFF, 0xFF, b'T']);
            let mut body = vec![b'I', 17];
            put_cstring(&mut body, b"My Test Server");
            put_cstring(&mut body, b"de_dust2");
            put_cstring(&mut body, b"cstrike");
            put_cstring(&mut body, b"Counter-Strike: Source");
            put_i32_le(&mut body, 240);
            body.extend_from_slice(&[12, 32, 2, b'd', b'l', 1, 0]);
            vec![with_header(&[0xFF; 4], &body)]
        });

        let mut codec = SourceEngineCodec::connect(&addr.to_string()).await.unwrap();
        let bundle = codec.query("info").await.expect("Expected a bundle");
        let metadata = bundle.server_metadata.unwrap();

        assert_eq!(metadata.server_name.as_deref(), Some("My Test Server"));
        assert_eq!(metadata.get("mapName"), Some("de_dust2"));
        assert_eq!(metadata.get("gameDirectory"), Some("cstrike"));
        assert_eq!(metadata.get("gameDescription"), Some("Counter-Strike: Source"));
        assert_eq!(metadata.get("steamApplicationID"), Some("240"));
        assert_eq!(metadata.get("playerCount"), Some("12"));
        assert_eq!(metadata.get("maxPlayers"), Some("32"));
        assert_eq!(metadata.get("botCount"), Some("2"));
        assert_eq!(metadata.get("serverType"), Some("d"));
        assert_eq!(metadata.get("serverOS"), Some("l"));
        assert_eq!(metadata.get("passworded"), Some("true"));
        assert_eq!(metadata.get("secureServer"), Some("false"));
        assert_eq!(bundle.round.unwrap().map.as_deref(), Some("de_dust2"));
    }

    /// Players are only returned once the challenge from the 'A' reply is echoed
    #[tokio::test]
    async fn source_engine_players_challenge() {
        const CHALLENGE: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

        let addr = spawn_udp_server(|request| {
            if request.len() != 9 || request[4] != b'U' {
                return vec![];
            }
            if request[5..] == [0xFF; 4] {
                return vec![with_header(&[0xFF; 4], &with_header(&[b'A'], &CHALLENGE))];
            }
            if request[5..] != CHALLENGE {
                return vec![];
            }
            let mut body = vec![b'D', 2];
            for (name, score) in [("alpha", 3), ("bravo", 9)] {
                body.push(0);
                put_cstring(&mut body, name.as_bytes());
                put_i32_le(&mut body, score);
                put_f32_le(&mut body, 60.0);
            }
            vec![with_header(&[0xFF; 4], &body)]
        });

        let mut codec = SourceEngineCodec::connect(&addr.to_string()).await.unwrap();
        let bundle = codec.query("players").await.expect("Expected a bundle");
        assert_eq!(bundle.players.len(), 2);
        assert_eq!(bundle.players[1].name, "bravo");
        assert!(!bundle.players[1].has_id());
        assert_eq!(bundle.scores[1].score, 9.0);

        // Cached challenge is reused without a second handshake
        let bundle = codec.query("players").await.expect("Expected a bundle");
        assert_eq!(bundle.players[0].name, "alpha");
    }

    fn idtech4_reply(request: &[u8], corrupt_challenge: bool) -> Vec<Vec<u8>> {
        let challenge = &request[request.len() - 8..];
        let mut data = vec![0xFF, 0xFF];
        put_cstring(&mut data, b"infoResponse");
        if corrupt_challenge {
            data.extend_from_slice(&[0u8; 8]);
        } else {
            data.extend_from_slice(challenge);
        }
        data.extend_from_slice(&[0, 21, 0, 10, 0, 0, 0, 0]);
        put_cstring(&mut data, b"si_name");
        put_cstring(&mut data, b"Quarry");
        put_cstring(&mut data, b"");
        put_cstring(&mut data, b"");
        data.push(3);
        data.extend_from_slice(&[10, 0]);
        put_cstring(&mut data, b"Aggressor");
        data.push(0);
        put_cstring(&mut data, b"");
        data.push(0);
        data.push(32);
        vec![data]
    }

    /// The echoed challenge binds the reply to the request
    #[tokio::test]
    async fn idtech4_challenge_binding() {
        let addr = spawn_udp_server(|request| idtech4_reply(request, false));
        let mut codec = IdTech4Codec::connect(&addr.to_string()).await.unwrap();
        let bundle = codec.query("info").await.expect("Expected a bundle");
        assert_eq!(
            bundle.server_metadata.unwrap().server_name.as_deref(),
            Some("Quarry")
        );
        assert_eq!(bundle.players.len(), 1);
        assert_eq!(bundle.players[0].id, "3");
        assert_eq!(bundle.players[0].name, "Aggressor");
        assert_eq!(bundle.players[0].bot, Some(false));

        let addr = spawn_udp_server(|request| idtech4_reply(request, true));
        let mut codec = IdTech4Codec::connect(&addr.to_string()).await.unwrap();
        assert!(codec.query("info").await.is_none());
    }

    /// A silent server yields no result instead of an error
    #[tokio::test]
    async fn silent_server_yields_nothing() {
        let addr = spawn_udp_server(|_| vec![]);
        let transport = UdpTransport::connect(&addr.to_string())
            .await
            .unwrap()
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(10));
        let mut codec = Quake3Codec::new(transport);
        assert!(codec.query("status").await.is_none());
    }
}

/// REMOTE CONSOLE TESTS
mod rcon_tests {
    use scraper::rcon::{encode_command, encode_login, RconClient, KEY_LEN};
    use shared::wire::put_prefixed_string;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    const KEY: [u8; KEY_LEN] = [7, 3, 9, 1, 4, 4, 2, 8, 6, 5];

    fn response_frame(text: &str) -> Vec<u8> {
        let mut body = Vec::new();
        put_prefixed_string(&mut body, text.as_bytes());
        let mut frame = (body.len() as i32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    /// A rejected login closes the socket and the next command logs in again
    #[tokio::test]
    async fn rejected_login_then_fresh_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().unwrap();
        let login_len = encode_login("admin", "secret", &KEY).len();

        let server = thread::spawn(move || {
            let (mut first, _) = listener.accept().unwrap();
            first.write_all(&KEY).unwrap();
            let mut login = vec![0u8; login_len];
            first.read_exact(&mut login).unwrap();
            first.write_all(&[0]).unwrap();
            drop(first);

            let (mut second, _) = listener.accept().unwrap();
            second.write_all(&KEY).unwrap();
            let mut login = vec![0u8; login_len];
            second.read_exact(&mut login).unwrap();
            assert_eq!(login, encode_login("admin", "secret", &KEY));
            second.write_all(&[1]).unwrap();

            let mut command = vec![0u8; encode_command("game.listPlayers").len()];
            second.read_exact(&mut command).unwrap();
            assert_eq!(command, encode_command("game.listPlayers"));
            second.write_all(&response_frame("Id: 1 - Sarge")).unwrap();

            // Hold the connection until the client closes it
            let mut rest = Vec::new();
            let _ = second.read_to_end(&mut rest);
        });

        let mut client = RconClient::new(&addr.to_string(), "admin", "secret")
            .with_timeout(Duration::from_secs(2));

        assert!(client.send_command("game.listPlayers").await.is_none());
        assert!(!client.is_connected());

        let response = client.send_command("game.listPlayers").await;
        assert_eq!(response.as_deref(), Some("Id: 1 - Sarge"));
        assert!(client.is_connected());

        client.disconnect().await;
        assert!(!client.is_connected());
        server.join().unwrap();
    }
}

/// DATA MANAGER TESTS
mod data_manager_tests {
    use super::*;

    /// Repeated polls of an unchanged server emit each record once
    #[tokio::test]
    async fn polling_unchanged_server_is_idempotent() {
        let addr = spawn_udp_server(|request| {
            if !request.ends_with(b"getstatus\n") {
                return vec![];
            }
            vec![with_header(
                &[0xFF; 4],
                b"statusResponse\n\\sv_hostname\\Q3 Test\\mapname\\q3dm6\n5 40 \"Visor\"\n2 80 \"Xaero\"\n",
            )]
        });

        let sink = Arc::new(CaptureSink::new());
        let manager = Arc::new(DataManager::new(sink.clone()));
        sink.clear();

        let codec = Quake3Codec::connect(&addr.to_string()).await.unwrap();
        let mut client = QueryClient::new(codec).with_period(Duration::from_millis(20));
        let target = Arc::clone(&manager);
        client.register_listener("status", move |_: &str, bundle: &QueryResultBundle| {
            target.apply_bundle(bundle);
        });

        client.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.shutdown().await;

        assert_eq!(manager.players().len(), 2);
        assert_eq!(manager.get_player("Visor").unwrap().name, "Visor");
        assert_eq!(manager.current_round().map.as_deref(), Some("q3dm6"));

        let messages = sink.messages();
        let aliases = messages.iter().filter(|m| m.kind() == "alias").count();
        let scores = messages.iter().filter(|m| m.kind() == "score").count();
        let metadata = messages.iter().filter(|m| m.kind() == "serverMetadata").count();
        assert_eq!(aliases, 2);
        assert_eq!(scores, 2);
        assert_eq!(metadata, 1);
    }

    /// Raw ids from two rounds never collide
    #[test]
    fn round_namespaces_isolate_player_ids() {
        let sink = Arc::new(CaptureSink::new());
        let manager = DataManager::new(sink.clone());
        manager.set_wipe_players_on_new_round(false);

        let first_round = manager.current_round().id;
        manager.provide_player_record(&Alias::new("7", "Alpha")).unwrap();
        manager.new_round(None);
        let second_round = manager.current_round().id;
        assert_ne!(first_round, second_round);

        let player = manager.get_player("7").unwrap();
        assert_eq!(player.id, format!("{}:7", second_round));
        assert_eq!(player.name, "Alpha");

        // Messages carry the round they belong to
        let last = sink.last().unwrap();
        assert_eq!(last.session_id, Some(second_round));
    }

    /// A score without a resolvable player is rejected and not stored
    #[test]
    fn unresolvable_score_is_rejected() {
        let sink = Arc::new(CaptureSink::new());
        let manager = DataManager::new(sink.clone());
        sink.clear();

        assert!(manager
            .provide_score_record(&Score::new(Alias::default(), 10.0))
            .is_err());
        assert!(manager
            .provide_score_record(&Score::new(Alias::named("Nobody"), 10.0))
            .is_err());
        assert!(manager.scores().is_empty());
        assert_eq!(sink.count(), 0);
    }

    /// Every emitted message names the round and carries the stored snapshot
    #[test]
    fn emitted_alias_uses_namespaced_id() {
        let sink = Arc::new(CaptureSink::new());
        let manager = DataManager::new(sink.clone());
        let round = manager.current_round().id;

        manager.provide_player_record(&Alias::new("12", "Hunter")).unwrap();
        match sink.last().unwrap().content {
            UpdateContent::Alias(alias) => assert_eq!(alias.id, format!("{}:12", round)),
            other => panic!("Unexpected content: {:?}", other),
        }
    }
}
