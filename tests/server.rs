//-
// Copyright (c) 2026, the berth authors
//
// This file is part of berth.
//
// berth is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// berth is distributed  in the hope that  it will be  useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// berth. If not, see <http://www.gnu.org/licenses/>.

//! End-to-end tests driving a live server over TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use berth::{DummyConnector, Server, ServerConfig};

const USER: &str = "azure";
const PASSWORD: &str = "hunter2";

struct TestServer {
    addr: std::net::SocketAddr,
    _dirs: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dirs = tempfile::tempdir().unwrap();

    let mut config = ServerConfig::new(
        dirs.path().join("data"),
        dirs.path().join("db"),
    );
    config.login_jail_time = Duration::from_millis(100);
    config.idle_bulk_time = Duration::from_millis(50);

    let server = Server::new(config).unwrap();
    server
        .add_user(USER, PASSWORD, Arc::new(DummyConnector::new()))
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    // Give the connector sync a moment to land INBOX.
    tokio::time::sleep(Duration::from_millis(200)).await;

    TestServer { addr, _dirs: dirs }
}

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_tag: u32,
}

impl Client {
    async fn connect(server: &TestServer) -> Self {
        let stream = TcpStream::connect(server.addr).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(read),
            writer,
            next_tag: 0,
        };

        let greeting = client.read_line().await;
        assert!(greeting.starts_with("* OK"), "greeting: {greeting}");
        client
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            self.reader.read_line(&mut line),
        )
        .await
        .expect("timed out reading line")
        .unwrap();
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Sends a command, returning every line up to and including the
    /// tagged response.
    async fn cmd(&mut self, command: &str) -> Vec<String> {
        self.next_tag += 1;
        let tag = format!("t{}", self.next_tag);
        self.send_raw(format!("{} {}\r\n", tag, command).as_bytes())
            .await;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.starts_with(&format!("{} ", tag));
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn cmd_ok(&mut self, command: &str) -> Vec<String> {
        let lines = self.cmd(command).await;
        let tagged = lines.last().unwrap();
        assert!(
            tagged.contains(" OK"),
            "command {command:?} failed: {lines:?}",
        );
        lines
    }

    async fn login(&mut self) {
        self.cmd_ok(&format!("LOGIN {} {}", USER, PASSWORD)).await;
    }

    /// APPEND via a synchronising literal, waiting for the continuation.
    async fn append(&mut self, mailbox: &str, body: &[u8]) -> Vec<String> {
        self.next_tag += 1;
        let tag = format!("t{}", self.next_tag);
        self.send_raw(
            format!("{} APPEND {} {{{}}}\r\n", tag, mailbox, body.len())
                .as_bytes(),
        )
        .await;

        let continuation = self.read_line().await;
        assert!(
            continuation.starts_with("+ "),
            "expected continuation, got: {continuation}",
        );

        self.send_raw(body).await;
        self.send_raw(b"\r\n").await;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.starts_with(&format!("{} ", tag));
            lines.push(line);
            if done {
                assert!(
                    lines.last().unwrap().contains(" OK"),
                    "append failed: {lines:?}",
                );
                return lines;
            }
        }
    }
}

fn find_line<'a>(lines: &'a [String], needle: &str) -> Option<&'a String> {
    lines.iter().find(|l| l.contains(needle))
}

#[tokio::test(flavor = "multi_thread")]
async fn login_select_and_greeting_flow() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;

    let lines = client.cmd("CAPABILITY").await;
    let caps = find_line(&lines, "* CAPABILITY").unwrap();
    assert!(caps.contains("IMAP4rev1"));
    assert!(caps.contains("IDLE"));
    assert!(caps.contains("UIDPLUS"));
    assert!(caps.contains("MOVE"));
    assert!(caps.contains("UNSELECT"));

    client.login().await;
    let lines = client.cmd_ok("SELECT INBOX").await;
    assert!(find_line(&lines, "* 0 EXISTS").is_some());
    assert!(find_line(&lines, "UIDVALIDITY").is_some());
    assert!(find_line(&lines, "UIDNEXT 1").is_some());

    client.cmd_ok("LOGOUT").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_jailed() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;

    let start = std::time::Instant::now();
    let lines = client.cmd(&format!("LOGIN {} wrong", USER)).await;
    assert!(lines.last().unwrap().contains(" NO"));
    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "login failure was not delayed",
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn uid_stability_across_reconnect() {
    let server = start_server().await;

    {
        let mut client = Client::connect(&server).await;
        client.login().await;
        client.cmd_ok("CREATE X").await;
        for i in 0..3 {
            client
                .append("X", format!("Subject: m{i}\r\n\r\nbody").as_bytes())
                .await;
        }
        client.cmd_ok("LOGOUT").await;
    }

    let mut client = Client::connect(&server).await;
    client.login().await;
    let lines = client.cmd_ok("SELECT X").await;
    assert!(find_line(&lines, "* 3 EXISTS").is_some());
    assert!(find_line(&lines, "[UIDNEXT 4]").is_some());

    let lines = client.cmd_ok("UID FETCH 1:3 FLAGS").await;
    for uid in 1..=3 {
        assert!(
            find_line(&lines, &format!("UID {uid}")).is_some(),
            "missing UID {uid}: {lines:?}",
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn expunge_responses_descend() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    for i in 0..5 {
        client
            .append(
                "INBOX",
                format!("Subject: m{i}\r\n\r\nbody").as_bytes(),
            )
            .await;
    }
    client.cmd_ok("SELECT INBOX").await;
    client.cmd_ok("STORE 2,4 +FLAGS.SILENT (\\Deleted)").await;

    let lines = client.cmd_ok("EXPUNGE").await;
    let expunges = lines
        .iter()
        .filter(|l| l.contains("EXPUNGE") && l.starts_with('*'))
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(
        vec!["* 4 EXPUNGE".to_owned(), "* 2 EXPUNGE".to_owned()],
        expunges,
    );

    // Three messages remain, renumbered densely.
    let lines = client.cmd_ok("FETCH 1:3 UID").await;
    assert!(find_line(&lines, "UID 1").is_some());
    assert!(find_line(&lines, "UID 3").is_some());
    assert!(find_line(&lines, "UID 5").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_receives_cross_session_append() {
    let server = start_server().await;

    let mut watcher = Client::connect(&server).await;
    watcher.login().await;
    watcher.cmd_ok("SELECT INBOX").await;

    watcher.send_raw(b"i1 IDLE\r\n").await;
    let continuation = watcher.read_line().await;
    assert!(continuation.starts_with("+ "));

    let mut other = Client::connect(&server).await;
    other.login().await;
    other.append("INBOX", b"Subject: push\r\n\r\nhello").await;

    // The EXISTS and RECENT arrive unsolicited within the bulk window.
    let line = watcher.read_line().await;
    assert_eq!("* 1 EXISTS", line);
    let line = watcher.read_line().await;
    assert_eq!("* 1 RECENT", line);

    watcher.send_raw(b"DONE\r\n").await;
    let tagged = watcher.read_line().await;
    assert!(tagged.starts_with("i1 OK"), "got: {tagged}");
}

#[tokio::test(flavor = "multi_thread")]
async fn uid_validity_bumps_on_delete_and_recreate() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    client.cmd_ok("CREATE X").await;
    let lines = client.cmd_ok("SELECT X").await;
    let before = uid_validity_of(&lines);
    client.cmd_ok("UNSELECT").await;

    client.cmd_ok("DELETE X").await;
    client.cmd_ok("CREATE X").await;
    let lines = client.cmd_ok("SELECT X").await;
    let after = uid_validity_of(&lines);

    assert!(
        after > before,
        "uidvalidity did not advance: {before} -> {after}",
    );
}

fn uid_validity_of(lines: &[String]) -> u32 {
    let line = find_line(lines, "UIDVALIDITY").unwrap();
    let start = line.find("UIDVALIDITY ").unwrap() + "UIDVALIDITY ".len();
    line[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn literal_with_embedded_crlf_round_trips() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    let payload = b"AB\r\nCD\r\nEFGH";
    assert_eq!(12, payload.len());
    client.append("INBOX", payload).await;

    client.cmd_ok("SELECT INBOX").await;

    client.next_tag += 1;
    let tag = format!("t{}", client.next_tag);
    client
        .send_raw(format!("{} FETCH 1 BODY.PEEK[]\r\n", tag).as_bytes())
        .await;

    // The response carries the body as a literal; pull the exact bytes.
    let header = client.read_line().await;
    assert!(header.contains("BODY[] {12}"), "got: {header}");

    let mut body = vec![0u8; 12];
    tokio::io::AsyncReadExt::read_exact(&mut client.reader, &mut body)
        .await
        .unwrap();
    assert_eq!(payload.to_vec(), body);

    loop {
        let line = client.read_line().await;
        if line.starts_with(&format!("{} ", tag)) {
            assert!(line.contains(" OK"));
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn search_unseen_matches_serial_and_parallel() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    for i in 0..20 {
        client
            .append(
                "INBOX",
                format!("Subject: m{i}\r\n\r\nbody {i}").as_bytes(),
            )
            .await;
    }

    client.cmd_ok("SELECT INBOX").await;
    // Mark the odd sequence numbers seen.
    client
        .cmd_ok("STORE 1:20 -FLAGS.SILENT (\\Seen)")
        .await;
    client
        .cmd_ok(
            "STORE 1,3,5,7,9,11,13,15,17,19 +FLAGS.SILENT (\\Seen)",
        )
        .await;

    let lines = client.cmd_ok("SEARCH UNSEEN").await;
    let hits = find_line(&lines, "* SEARCH").unwrap();
    let expected = format!(
        "* SEARCH {}",
        (1..=20)
            .filter(|n| n % 2 == 0)
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" "),
    );
    assert_eq!(&expected, hits);

    // Subject search exercises the literal/header path.
    let lines = client.cmd_ok("SEARCH SUBJECT m7").await;
    assert_eq!("* SEARCH 8", find_line(&lines, "* SEARCH").unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn store_round_trip_and_copy_keeps_destination() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    client.append("INBOX", b"Subject: a\r\n\r\none").await;
    client.append("INBOX", b"Subject: b\r\n\r\ntwo").await;
    client.cmd_ok("CREATE saved").await;
    client.cmd_ok("SELECT INBOX").await;

    // STORE +FLAGS then -FLAGS restores the original set.
    let lines = client.cmd_ok("STORE 1 +FLAGS (\\Flagged)").await;
    assert!(find_line(&lines, "\\Flagged").is_some());
    let lines = client.cmd_ok("STORE 1 -FLAGS (\\Flagged)").await;
    let fetch = find_line(&lines, "* 1 FETCH").unwrap();
    assert!(!fetch.contains("\\Flagged"));

    // COPY, then expunge the source; the destination is intact.
    let lines = client.cmd_ok("COPY 1:2 saved").await;
    assert!(
        find_line(&lines, "COPYUID").is_some(),
        "missing COPYUID: {lines:?}",
    );
    client
        .cmd_ok("STORE 1:2 +FLAGS.SILENT (\\Deleted)")
        .await;
    client.cmd_ok("EXPUNGE").await;

    let lines = client.cmd_ok("STATUS saved (MESSAGES)").await;
    assert!(
        find_line(&lines, "MESSAGES 2").is_some(),
        "destination lost messages: {lines:?}",
    );
    let lines = client.cmd_ok("STATUS INBOX (MESSAGES)").await;
    assert!(find_line(&lines, "MESSAGES 0").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn move_expunges_source() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    client.append("INBOX", b"Subject: a\r\n\r\none").await;
    client.cmd_ok("CREATE dst").await;
    client.cmd_ok("SELECT INBOX").await;

    let lines = client.cmd_ok("MOVE 1 dst").await;
    assert!(find_line(&lines, "COPYUID").is_some());
    assert!(find_line(&lines, "* 1 EXPUNGE").is_some());

    let lines = client.cmd_ok("STATUS dst (MESSAGES)").await;
    assert!(find_line(&lines, "MESSAGES 1").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_and_oversized_literals_are_rejected() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;

    client.send_raw(b"t1 APPEND INBOX {0}\r\n").await;
    let line = client.read_line().await;
    assert!(line.contains("BAD"), "got: {line}");

    // One byte over the 30 MiB cap.
    let oversized = 30 * 1024 * 1024 + 1;
    client
        .send_raw(format!("t2 APPEND INBOX {{{oversized}}}\r\n").as_bytes())
        .await;
    let line = client.read_line().await;
    assert!(line.contains("BAD"), "got: {line}");
}

#[tokio::test(flavor = "multi_thread")]
async fn parse_errors_recover_with_bad() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;

    client.send_raw(b"t1 FROBNICATE\r\n").await;
    let line = client.read_line().await;
    assert!(line.starts_with("t1 BAD"), "got: {line}");

    // The session is still usable.
    let lines = client.cmd("NOOP").await;
    assert!(lines.last().unwrap().contains(" OK"));
}

#[tokio::test(flavor = "multi_thread")]
async fn star_in_empty_mailbox_matches_nothing() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;
    client.login().await;
    client.cmd_ok("SELECT INBOX").await;

    let lines = client.cmd_ok("UID FETCH 1:* FLAGS").await;
    assert!(
        !lines.iter().any(|l| l.contains("FETCH (")),
        "empty mailbox produced fetch data: {lines:?}",
    );

    let lines = client.cmd_ok("SEARCH ALL").await;
    assert_eq!(
        "* SEARCH",
        find_line(&lines, "* SEARCH").unwrap(),
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_expunges_defer_during_fetch() {
    let server = start_server().await;

    let mut a = Client::connect(&server).await;
    a.login().await;
    for i in 0..3 {
        a.append("INBOX", format!("Subject: m{i}\r\n\r\nx").as_bytes())
            .await;
    }
    a.cmd_ok("SELECT INBOX").await;

    let mut b = Client::connect(&server).await;
    b.login().await;
    b.cmd_ok("SELECT INBOX").await;
    b.cmd_ok("STORE 1,3 +FLAGS.SILENT (\\Deleted)").await;
    b.cmd_ok("EXPUNGE").await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    // FETCH may not carry the expunges: A's sequence numbers must stay
    // valid for the whole command.
    let lines = a.cmd_ok("FETCH 1:3 UID").await;
    assert!(
        !lines.iter().any(|l| l.contains("EXPUNGE")),
        "expunge leaked into FETCH: {lines:?}",
    );
    assert!(find_line(&lines, "UID 1").is_some());
    assert!(find_line(&lines, "UID 2").is_some());
    assert!(find_line(&lines, "UID 3").is_some());

    // The next permissive command delivers them, highest seqnum first.
    let lines = a.cmd_ok("NOOP").await;
    let expunges = lines
        .iter()
        .filter(|l| l.contains("EXPUNGE"))
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(
        vec!["* 3 EXPUNGE".to_owned(), "* 1 EXPUNGE".to_owned()],
        expunges,
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sessions_converge_on_the_same_uids() {
    let server = start_server().await;

    let mut a = Client::connect(&server).await;
    a.login().await;
    a.cmd_ok("SELECT INBOX").await;

    let mut b = Client::connect(&server).await;
    b.login().await;
    b.cmd_ok("SELECT INBOX").await;

    a.append("INBOX", b"Subject: one\r\n\r\n1").await;
    b.append("INBOX", b"Subject: two\r\n\r\n2").await;

    // NOOP is the quiescent point where piggy-backed updates land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let lines_a = a.cmd_ok("NOOP").await;
    let lines_b = b.cmd_ok("NOOP").await;
    assert!(find_line(&lines_a, "2 EXISTS").is_some());
    assert!(find_line(&lines_b, "2 EXISTS").is_some());

    let uids_a = a.cmd_ok("UID SEARCH ALL").await;
    let uids_b = b.cmd_ok("UID SEARCH ALL").await;
    assert_eq!(
        find_line(&uids_a, "* SEARCH"),
        find_line(&uids_b, "* SEARCH"),
    );
}
