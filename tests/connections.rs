extern crate conntable;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;

use conntable::{ConnectionKey, Error, Settings, Table};

/// Per-connection state, as a packet handler would keep it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct State {
    packets: u32,
    bytes: u64,
    open: bool,
}

fn key(client: u8, port: u16) -> ConnectionKey {
    ConnectionKey::from_addrs(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 443),
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, client), port),
    )
}

#[test]
fn connection_lifecycle() {
    let table = Table::new(8).unwrap();
    let conn = key(7, 40000);

    table.key_init(conn, || Some(State { open: true, .. State::default() })).unwrap();

    for len in &[60u64, 1500, 1500] {
        table.update(&conn, |state| {
            if state.open {
                Some(State {
                    packets: state.packets + 1,
                    bytes: state.bytes + len,
                    open: true,
                })
            } else {
                None
            }
        }).unwrap();
    }

    assert_eq!(*table.get(&conn).unwrap(), State { packets: 3, bytes: 3060, open: true });

    // Closing the connection hands back the final state.
    let closed = table.swap(&conn, State::default()).unwrap();
    assert_eq!(closed.packets, 3);
    assert_eq!(table.update(&conn, |_| None), Err(Error::Declined));

    table.delete(&conn).unwrap();
    assert!(table.get(&conn).is_none());
    assert!(table.is_empty());

    // The same connection can be reopened.
    table.insert(conn, State { open: true, .. State::default() }).unwrap();
    assert!(table.get(&conn).unwrap().open);
}

#[test]
fn per_address_counters() {
    // Count connections per client address.
    let settings = Settings::low_latency().size_exponent(6);
    let table: Arc<Table<u32, u32>> = Arc::new(Table::with_settings(settings).unwrap());
    let mut joins = Vec::new();

    for client in 0..4u8 {
        table.insert(u32::from(Ipv4Addr::new(192, 168, 0, client)), 0).unwrap();
    }

    for t in 0..8u16 {
        let table = table.clone();
        joins.push(thread::spawn(move || {
            for port in 0..200u16 {
                let conn = key((port % 4) as u8, t * 1000 + port);
                table.update(&conn.client_addr, |n| Some(n + 1)).unwrap();
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    for client in 0..4u8 {
        assert_eq!(*table.get(&u32::from(Ipv4Addr::new(192, 168, 0, client))).unwrap(), 400);
    }
}

#[test]
fn distinct_connections_from_one_client() {
    let table = Table::new(10).unwrap();

    for port in 1000..1500 {
        table.insert(key(1, port), u64::from(port)).unwrap();
    }

    assert_eq!(table.len(), 500);
    for port in 1000..1500 {
        assert_eq!(*table.get(&key(1, port)).unwrap(), u64::from(port));
    }
    assert!(table.get(&key(2, 1000)).is_none());

    let mut total = 0;
    table.for_each(|k, v| {
        assert_eq!(k.client_port as u64, *v);
        total += 1;
    });
    assert_eq!(total, 500);
}

#[test]
fn invalid_size() {
    assert_eq!(Table::<ConnectionKey, u64>::new(0).unwrap_err(), Error::SizeExponent(0));
}
