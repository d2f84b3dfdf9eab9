// End-to-end tests against a server bound to an ephemeral port.

use ldap3::exop::WhoAmI;
use ldap3::{LdapConnAsync, Scope, SearchEntry};
use ldap_inmem_server::ber::Asn1StreamReader;
use ldap_inmem_server::controls::{RequestControl, SortKey, VlvTarget};
use ldap_inmem_server::extended::ExtendedRegistry;
use ldap_inmem_server::ldap_protocol::{
    BindRequest, Filter, LdapMessage, ProtocolOp, ResultCode, SearchRequest, SearchScope,
    NOTICE_OF_DISCONNECTION_OID,
};
use ldap_inmem_server::sasl::SaslRegistry;
use ldap_inmem_server::{Config, LdapHandler, LdapServer, Metrics};
use std::collections::HashSet;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
listeners:
  - name: test
    url: "ldap://127.0.0.1:0"
base_dns: ["dc=example,dc=com"]
additional_bind_credentials:
  - dn: "cn=Directory Manager"
    password: password
entries:
  - dn: "dc=example,dc=com"
    attributes:
      objectClass: [top, domain]
  - dn: "ou=people,dc=example,dc=com"
    attributes:
      objectClass: [top, organizationalUnit]
  - dn: "uid=alice,ou=people,dc=example,dc=com"
    attributes:
      objectClass: [top, person]
      cn: Alice Liddell
      sn: Liddell
      userPassword: wonderland
  - dn: "uid=bob,ou=people,dc=example,dc=com"
    attributes:
      objectClass: [top, person]
      cn: Bob Builder
      sn: Builder
      userPassword: canwefixit
"#;

async fn start_server() -> (SocketAddr, Arc<Metrics>) {
    start_server_with(Config::from_str(CONFIG).unwrap()).await
}

async fn start_server_with(config: Config) -> (SocketAddr, Arc<Metrics>) {
    config.validate().unwrap();
    let directory = Arc::new(config.build_directory().unwrap());
    let metrics = Arc::new(Metrics::default());
    let handler = Arc::new(LdapHandler::new(
        directory,
        SaslRegistry::with_mechanisms(&config.sasl_mechanisms, config.allow_anonymous_sasl_plain),
        ExtendedRegistry::with_defaults(),
        config.handler_settings(),
        Arc::clone(&metrics),
    ));
    let server = LdapServer::new(config.listeners.clone(), handler, config.connection.clone());
    let bound = server.bind().await.unwrap();
    let addr = bound[0].local_addr;
    tokio::spawn(async move {
        let _ = server.serve(bound).await;
    });
    (addr, metrics)
}

fn read_message(stream: &mut TcpStream) -> LdapMessage {
    let mut reader = Asn1StreamReader::new(stream);
    LdapMessage::read_from(&mut reader).unwrap().unwrap()
}

#[tokio::test]
async fn test_ldap3_bind_search_and_whoami() {
    let (addr, _metrics) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).await.unwrap();
    ldap3::drive!(conn);

    ldap.simple_bind("uid=alice,ou=people,dc=example,dc=com", "wonderland")
        .await
        .unwrap()
        .success()
        .unwrap();

    let (entries, _) = ldap
        .search("dc=example,dc=com", Scope::Subtree, "(objectClass=person)", vec!["cn"])
        .await
        .unwrap()
        .success()
        .unwrap();
    let mut names: Vec<String> = entries
        .into_iter()
        .map(|e| SearchEntry::construct(e).attrs["cn"][0].clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Alice Liddell", "Bob Builder"]);

    let (exop, _) = ldap.extended(WhoAmI).await.unwrap().success().unwrap();
    let authzid = String::from_utf8(exop.val.unwrap()).unwrap();
    assert_eq!(authzid, "dn:uid=alice,ou=people,dc=example,dc=com");

    ldap.unbind().await.unwrap();
}

#[tokio::test]
async fn test_ldap3_wrong_password() {
    let (addr, _metrics) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).await.unwrap();
    ldap3::drive!(conn);

    let result = ldap
        .simple_bind("uid=alice,ou=people,dc=example,dc=com", "looking-glass")
        .await
        .unwrap();
    assert_eq!(result.rc, 49);
    ldap.unbind().await.unwrap();
}

#[tokio::test]
async fn test_ldap3_add_compare_delete() {
    let (addr, metrics) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).await.unwrap();
    ldap3::drive!(conn);

    ldap.simple_bind("cn=Directory Manager", "password")
        .await
        .unwrap()
        .success()
        .unwrap();

    let dn = "uid=carol,ou=people,dc=example,dc=com";
    ldap.add(
        dn,
        vec![
            ("objectClass", HashSet::from(["top", "person"])),
            ("cn", HashSet::from(["Carol Danvers"])),
            ("sn", HashSet::from(["Danvers"])),
        ],
    )
    .await
    .unwrap()
    .success()
    .unwrap();

    let equal = ldap.compare(dn, "sn", "Danvers").await.unwrap().equal().unwrap();
    assert!(equal);
    let equal = ldap.compare(dn, "sn", "Marvel").await.unwrap().equal().unwrap();
    assert!(!equal);

    let duplicate = ldap
        .add(dn, vec![("objectClass", HashSet::from(["person"]))])
        .await
        .unwrap();
    assert_eq!(duplicate.rc, 68);

    ldap.delete(dn).await.unwrap().success().unwrap();
    let gone = ldap
        .search(dn, Scope::Base, "(objectClass=*)", Vec::<&str>::new())
        .await
        .unwrap();
    assert!(gone.0.is_empty());
    assert_eq!(gone.1.rc, 32);

    ldap.unbind().await.unwrap();
    let rendered = metrics.render(0);
    assert!(rendered.contains("ldap_inmem_requests_total{op=\"add\"} 2"));
}

#[tokio::test]
async fn test_vlv_without_sort_is_rejected() {
    let (addr, _metrics) = start_server().await;
    let message = tokio::task::spawn_blocking(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        let vlv = RequestControl::VirtualListView {
            before_count: 0,
            after_count: 10,
            target: VlvTarget::ByOffset {
                offset: 1,
                content_count: 0,
            },
            context_id: None,
        };
        let search = SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::WholeSubtree,
            Filter::present("objectClass"),
        );
        let request = LdapMessage::new(2, ProtocolOp::SearchRequest(search))
            .with_controls(vec![vlv.to_control(true)]);
        client.write_all(&request.encode()).unwrap();
        read_message(&mut client)
    })
    .await
    .unwrap();

    assert_eq!(message.message_id, 2);
    match message.protocol_op {
        ProtocolOp::SearchResultDone(result) => {
            assert_eq!(result.result_code, ResultCode::SORT_CONTROL_MISSING)
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_sorted_search_over_raw_socket() {
    let (addr, _metrics) = start_server().await;
    let responses = tokio::task::spawn_blocking(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        let bind = LdapMessage::new(
            1,
            ProtocolOp::BindRequest(BindRequest::simple("cn=Directory Manager", "password")),
        );
        client.write_all(&bind.encode()).unwrap();
        let bound = read_message(&mut client);

        let sort = RequestControl::ServerSideSort(vec![SortKey {
            attribute: "sn".to_string(),
            ordering_rule: None,
            reverse: true,
        }]);
        let mut search = SearchRequest::new(
            "ou=people,dc=example,dc=com",
            SearchScope::SingleLevel,
            Filter::equality("objectClass", "person"),
        );
        search.attributes = vec!["sn".to_string()];
        let request = LdapMessage::new(2, ProtocolOp::SearchRequest(search))
            .with_controls(vec![sort.to_control(true)]);
        client.write_all(&request.encode()).unwrap();

        let mut messages = vec![bound];
        loop {
            let message = read_message(&mut client);
            let done = matches!(message.protocol_op, ProtocolOp::SearchResultDone(_));
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    })
    .await
    .unwrap();

    match &responses[0].protocol_op {
        ProtocolOp::BindResponse(r) => assert_eq!(r.result.result_code, ResultCode::SUCCESS),
        other => panic!("unexpected response {:?}", other),
    }
    let dns: Vec<&str> = responses[1..]
        .iter()
        .filter_map(|m| match &m.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => Some(entry.dn.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        dns,
        vec![
            "uid=alice,ou=people,dc=example,dc=com",
            "uid=bob,ou=people,dc=example,dc=com"
        ]
    );
    let done = responses.last().unwrap();
    assert_eq!(done.controls.len(), 1);
}

#[tokio::test]
async fn test_garbage_gets_notice_of_disconnection() {
    let (addr, metrics) = start_server().await;
    let notice = tokio::task::spawn_blocking(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        // an unbind request whose NULL carries a value byte
        client
            .write_all(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x42, 0x01, 0x00])
            .unwrap();
        read_message(&mut client)
    })
    .await
    .unwrap();

    assert_eq!(notice.message_id, 0);
    match notice.protocol_op {
        ProtocolOp::ExtendedResponse(response) => {
            assert_eq!(response.result.result_code, ResultCode::PROTOCOL_ERROR);
            assert_eq!(response.oid.as_deref(), Some(NOTICE_OF_DISCONNECTION_OID));
        }
        other => panic!("unexpected response {:?}", other),
    }
    assert!(metrics.render(0).contains("ldap_inmem_decode_errors_total 1"));
}

fn anonymous_bind() -> LdapMessage {
    LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("", "")))
}

#[test]
fn test_idle_clients_do_not_hold_up_new_ones() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let (addr, metrics) = runtime.block_on(start_server());
    let _idle: Vec<TcpStream> = (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(&anonymous_bind().encode()).unwrap();
    match read_message(&mut client).protocol_op {
        ProtocolOp::BindResponse(r) => assert_eq!(r.result.result_code, ResultCode::SUCCESS),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(metrics.connections_rejected(), 0);
}

/// Binds anonymously and returns the response, `None` when the server
/// refused or dropped the connection.
fn try_bind(addr: SocketAddr) -> Option<LdapMessage> {
    let mut client = TcpStream::connect(addr).ok()?;
    client.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    client.write_all(&anonymous_bind().encode()).ok()?;
    let mut reader = Asn1StreamReader::new(&mut client);
    match LdapMessage::read_from(&mut reader) {
        Ok(Some(message)) if matches!(message.protocol_op, ProtocolOp::BindResponse(_)) => {
            Some(message)
        }
        _ => None,
    }
}

#[tokio::test]
async fn test_connections_over_the_limit_are_refused_busy() {
    let mut config = Config::from_str(CONFIG).unwrap();
    config.connection.max_connections = 1;
    let (addr, metrics) = start_server_with(config).await;

    let (notice, after_release) = tokio::task::spawn_blocking(move || {
        let mut first = TcpStream::connect(addr).unwrap();
        first.write_all(&anonymous_bind().encode()).unwrap();
        read_message(&mut first);

        let mut second = TcpStream::connect(addr).unwrap();
        let notice = read_message(&mut second);

        drop(first);
        let after_release = (0..50).find_map(|_| {
            try_bind(addr).or_else(|| {
                std::thread::sleep(Duration::from_millis(20));
                None
            })
        });
        (notice, after_release)
    })
    .await
    .unwrap();

    match notice.protocol_op {
        ProtocolOp::ExtendedResponse(response) => {
            assert_eq!(response.result.result_code, ResultCode::BUSY);
            assert_eq!(response.oid.as_deref(), Some(NOTICE_OF_DISCONNECTION_OID));
        }
        other => panic!("unexpected response {:?}", other),
    }
    assert!(after_release.is_some(), "the slot of a closed connection is reused");
    assert!(metrics.connections_rejected() >= 1);
}

#[tokio::test]
async fn test_ldap3_anonymous_cannot_reset_password() {
    let (addr, _metrics) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).await.unwrap();
    ldap3::drive!(conn);

    let reset = ldap3::exop::PasswordModify {
        user_id: Some("uid=alice,ou=people,dc=example,dc=com"),
        old_pass: None,
        new_pass: Some("taken"),
    };
    let result = ldap.extended(reset).await.unwrap();
    assert_eq!(result.1.rc, 53);

    let bind = ldap
        .simple_bind("uid=alice,ou=people,dc=example,dc=com", "taken")
        .await
        .unwrap();
    assert_eq!(bind.rc, 49);
    ldap.unbind().await.unwrap();
}

#[tokio::test]
async fn test_ldap3_paged_search_returns_every_entry_once() {
    let (addr, _metrics) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).await.unwrap();
    ldap3::drive!(conn);

    let adapters: Vec<Box<dyn ldap3::adapters::Adapter<_, _>>> =
        vec![Box::new(ldap3::adapters::PagedResults::new(1))];
    let mut stream = ldap
        .streaming_search_with(
            adapters,
            "dc=example,dc=com",
            Scope::Subtree,
            "(objectClass=*)",
            vec!["dn"],
        )
        .await
        .unwrap();
    let mut dns = Vec::new();
    while let Some(entry) = stream.next().await.unwrap() {
        dns.push(SearchEntry::construct(entry).dn);
    }
    let result = stream.finish().await;
    assert_eq!(result.rc, 0);
    assert_eq!(dns.len(), 4);
    assert_eq!(dns.iter().collect::<HashSet<_>>().len(), 4);
    ldap.unbind().await.unwrap();
}
