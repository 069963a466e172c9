//! Client session tests against a scripted in-process NBD server.
//!
//! The server thread speaks just enough fixed-newstyle protocol to exercise
//! the handshake, structured replies, and every transmission command the
//! client sends.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use nbd::proto;
use nbd::{extents, Client, Extent};

const EXPORT_SIZE: u64 = 1024 * 1024;

// Transmission flags: HAS_FLAGS, SEND_FLUSH, SEND_TRIM, SEND_WRITE_ZEROES.
const FLAGS: u16 = 1 | (1 << 2) | (1 << 5) | (1 << 6);

fn serve(mut s: UnixStream, image: &Arc<Mutex<Vec<u8>>>) {
    // Fixed newstyle greeting.
    s.write_u64::<BE>(proto::NBDMAGIC).unwrap();
    s.write_u64::<BE>(proto::IHAVEOPT).unwrap();
    s.write_u16::<BE>(1).unwrap(); // FIXED_NEWSTYLE
    let _client_flags = s.read_u32::<BE>().unwrap();

    // Option haggling until GO.
    loop {
        let magic = s.read_u64::<BE>().unwrap();
        assert_eq!(magic, proto::IHAVEOPT);
        let option = s.read_u32::<BE>().unwrap();
        let length = s.read_u32::<BE>().unwrap();
        let mut data = vec![0u8; length as usize];
        s.read_exact(&mut data).unwrap();

        match option {
            // structured replies
            8 => option_reply(&mut s, option, 1, &[]),
            // set meta context: one context id + name, then ack
            10 => {
                let mut payload = Vec::new();
                payload.write_u32::<BE>(1).unwrap();
                payload.extend_from_slice(b"base:allocation");
                option_reply(&mut s, option, 4, &payload);
                option_reply(&mut s, option, 1, &[]);
            }
            // go: export info, then ack, then transmission
            7 => {
                let mut payload = Vec::new();
                payload.write_u16::<BE>(0).unwrap(); // INFO_EXPORT
                payload.write_u64::<BE>(EXPORT_SIZE).unwrap();
                payload.write_u16::<BE>(FLAGS).unwrap();
                option_reply(&mut s, option, 3, &payload);
                option_reply(&mut s, option, 1, &[]);
                break;
            }
            other => panic!("unexpected option {other}"),
        }
    }

    // Transmission phase.
    loop {
        let magic = s.read_u32::<BE>().unwrap();
        assert_eq!(magic, proto::REQUEST_MAGIC);
        let _flags = s.read_u16::<BE>().unwrap();
        let command = s.read_u16::<BE>().unwrap();
        let cookie = s.read_u64::<BE>().unwrap();
        let offset = s.read_u64::<BE>().unwrap();
        let length = s.read_u32::<BE>().unwrap();

        match command {
            // read: one offset-data chunk with the done flag
            0 => {
                let data = {
                    let image = image.lock().unwrap();
                    image[offset as usize..(offset + u64::from(length)) as usize].to_vec()
                };
                s.write_u32::<BE>(proto::STRUCTURED_REPLY_MAGIC).unwrap();
                s.write_u16::<BE>(1).unwrap(); // DONE
                s.write_u16::<BE>(1).unwrap(); // OFFSET_DATA
                s.write_u64::<BE>(cookie).unwrap();
                s.write_u32::<BE>(8 + length).unwrap();
                s.write_u64::<BE>(offset).unwrap();
                s.write_all(&data).unwrap();
            }
            // write
            1 => {
                let mut data = vec![0u8; length as usize];
                s.read_exact(&mut data).unwrap();
                image.lock().unwrap()[offset as usize..(offset + u64::from(length)) as usize]
                    .copy_from_slice(&data);
                simple_reply(&mut s, cookie);
            }
            // disconnect
            2 => return,
            // flush and trim
            3 | 4 => simple_reply(&mut s, cookie),
            // write zeroes
            6 => {
                image.lock().unwrap()[offset as usize..(offset + u64::from(length)) as usize]
                    .fill(0);
                simple_reply(&mut s, cookie);
            }
            // block status: first half data, second half zero, split into
            // two extents of the same type each to exercise merging
            7 => {
                let half = length / 2;
                let quarter = half / 2;
                s.write_u32::<BE>(proto::STRUCTURED_REPLY_MAGIC).unwrap();
                s.write_u16::<BE>(1).unwrap(); // DONE
                s.write_u16::<BE>(5).unwrap(); // BLOCK_STATUS
                s.write_u64::<BE>(cookie).unwrap();
                s.write_u32::<BE>(4 + 4 * 8).unwrap();
                s.write_u32::<BE>(1).unwrap(); // context id
                for (len, flags) in [
                    (quarter, 0u32),
                    (half - quarter, 0),
                    (quarter, proto::STATE_HOLE | proto::STATE_ZERO),
                    (length - half - quarter, proto::STATE_HOLE | proto::STATE_ZERO),
                ] {
                    s.write_u32::<BE>(len).unwrap();
                    s.write_u32::<BE>(flags).unwrap();
                }
            }
            other => panic!("unexpected command {other}"),
        }
    }
}

fn option_reply(s: &mut UnixStream, option: u32, reply_type: u32, data: &[u8]) {
    s.write_u64::<BE>(proto::OPTION_REPLY_MAGIC).unwrap();
    s.write_u32::<BE>(option).unwrap();
    s.write_u32::<BE>(reply_type).unwrap();
    s.write_u32::<BE>(data.len() as u32).unwrap();
    s.write_all(data).unwrap();
}

fn simple_reply(s: &mut UnixStream, cookie: u64) {
    s.write_u32::<BE>(proto::SIMPLE_REPLY_MAGIC).unwrap();
    s.write_u32::<BE>(0).unwrap();
    s.write_u64::<BE>(cookie).unwrap();
}

#[test]
fn session_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nbd.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let image = Arc::new(Mutex::new(vec![0u8; EXPORT_SIZE as usize]));
    let served = Arc::clone(&image);
    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream, &served);
    });

    let mut client = Client::connect_unix(&path, "").unwrap();
    assert_eq!(client.export_size(), EXPORT_SIZE);
    assert!(client.writable());
    assert!(client.can_flush());
    assert!(client.can_trim());
    assert!(client.can_zero());
    assert!(client.can_extents());

    // Write, then read the same bytes back.
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    client.write_at(4096, &payload).unwrap();
    let mut read_back = vec![0u8; payload.len()];
    client.read_at(4096, &mut read_back).unwrap();
    assert_eq!(read_back, payload);

    // Zero the range and read zeroes back.
    client.zero(4096, payload.len() as u64, false).unwrap();
    client.read_at(4096, &mut read_back).unwrap();
    assert!(read_back.iter().all(|&b| b == 0));

    client.trim(0, 4096).unwrap();
    client.flush().unwrap();

    // Block status raw extents: four scripted extents.
    let raw = client.block_status(0, 65536).unwrap();
    assert_eq!(raw.len(), 4);
    assert!(!raw[0].zero());
    assert!(raw[3].zero());

    // The extent iterator merges same-type neighbours into two extents.
    let merged: Vec<Extent> = extents(&mut client, 0, Some(65536))
        .collect::<nbd::Result<_>>()
        .unwrap();
    assert_eq!(
        merged,
        vec![
            Extent { start: 0, length: 32768, zero: false },
            Extent { start: 32768, length: 32768, zero: true },
        ]
    );

    client.close().unwrap();
    drop(client);
    server.join().unwrap();
}
