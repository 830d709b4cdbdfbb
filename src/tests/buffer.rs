use std::io::{Read, Write};
use std::time::Duration;

use crate::buffer::{make_pipe, OutputBuffer};

#[test]
fn drains_producer_output() {
    let buffer = OutputBuffer::new();
    let mut write = buffer.attach().unwrap();
    write.write_all(b"hello drain\n").unwrap();
    drop(write);
    buffer.wait_eof();
    assert_eq!(buffer.contents_string(), "hello drain\n");
}

#[test]
fn second_attach_appends() {
    let buffer = OutputBuffer::new();
    let mut first = buffer.attach().unwrap();
    first.write_all(b"one").unwrap();
    drop(first);
    buffer.wait_eof();

    let mut second = buffer.attach().unwrap();
    second.write_all(b"two").unwrap();
    drop(second);
    buffer.wait_eof();

    assert_eq!(buffer.contents_string(), "onetwo");
}

#[test]
fn wait_eof_observes_every_byte() {
    let buffer = OutputBuffer::new();
    let mut write = buffer.attach().unwrap();
    let payload = vec![b'x'; 256 * 1024];
    let writer = std::thread::spawn(move || {
        write.write_all(&payload).unwrap();
        // write drops here, closing the pipe
    });
    buffer.wait_eof();
    writer.join().unwrap();
    assert_eq!(buffer.contents().len(), 256 * 1024);
}

#[test]
fn forward_to_next_replays_contents() {
    let buffer = OutputBuffer::new();
    let mut write = buffer.attach().unwrap();
    write.write_all(b"replayed bytes").unwrap();
    drop(write);

    let mut read = buffer.forward_to_next().unwrap();
    let mut replayed = String::new();
    read.read_to_string(&mut replayed).unwrap();
    assert_eq!(replayed, "replayed bytes");
}

#[test]
fn pipe_preserves_order() {
    let (mut read, mut write) = make_pipe().unwrap();
    let writer = std::thread::spawn(move || {
        for i in 0..100u8 {
            write.write_all(&[i]).unwrap();
            std::thread::sleep(Duration::from_micros(50));
        }
    });
    let mut seen = Vec::new();
    read.read_to_end(&mut seen).unwrap();
    writer.join().unwrap();
    assert_eq!(seen, (0..100u8).collect::<Vec<_>>());
}
