use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use fab_xfer::XferError;
use fab_xfer::buffer::ByteBuf;
use fab_xfer::fifo::Fifo;
use fab_xfer::terminal::{REF_LINE, Sink, Source, Terminal};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn reference(nreps: usize) -> Vec<u8> {
    REF_LINE.repeat(nreps)
}

/// Shuttle buffers between a source and a sink until both reach EOF.
fn pump(source: &mut Terminal, sink: &mut Terminal, bufs: usize) {
    let mut empty = Fifo::new(64);
    let mut filled = Fifo::new(64);
    for i in 0..bufs {
        empty.put(ByteBuf::new(23 + i)).unwrap();
    }
    for _ in 0..1_000_000 {
        source.trade(&mut empty, &mut filled).unwrap();
        sink.trade(&mut filled, &mut empty).unwrap();
        if source.eof() && sink.eof() {
            return;
        }
    }
    panic!("terminals did not reach EOF");
}

#[test]
fn test_source_to_sink_round_trip() {
    let out = SharedBuf::default();
    let mut source = Terminal::Source(Source::new(7));
    let mut sink = Terminal::Sink(Sink::with_echo(7, Box::new(out.clone())));
    pump(&mut source, &mut sink, 3);
    assert_eq!(out.contents(), reference(7));
}

#[test]
fn test_reference_line_length() {
    assert_eq!(REF_LINE.len(), 78);
    assert_eq!(REF_LINE[77], b'\n');
}

#[test]
fn test_sink_rejects_corrupt_byte() {
    let mut sink = Terminal::Sink(Sink::new(1));
    let mut ready = Fifo::new(4);
    let mut completed = Fifo::new(4);

    let mut buf = ByteBuf::new(30);
    {
        let mut cell = buf.cell().lock();
        cell[..30].copy_from_slice(&REF_LINE[..30]);
        cell[12] ^= 0xFF;
    }
    buf.nused = 30;
    ready.put(buf).unwrap();

    match sink.trade(&mut ready, &mut completed) {
        Err(XferError::Verify { at: 12 }) => {}
        other => panic!("expected verification failure at byte 12, got {other:?}"),
    }
}

#[test]
fn test_sink_rejects_bytes_past_eof() {
    let out = SharedBuf::default();
    let mut source = Terminal::Source(Source::new(1));
    let mut sink = Terminal::Sink(Sink::with_echo(1, Box::new(out)));
    pump(&mut source, &mut sink, 2);
    assert!(sink.eof());

    // One more buffer after the configured total is an overrun.
    let mut ready = Fifo::new(4);
    let mut completed = Fifo::new(4);
    let mut extra = ByteBuf::new(23);
    {
        let mut cell = extra.cell().lock();
        cell[..23].copy_from_slice(&REF_LINE[..23]);
    }
    extra.nused = 23;
    ready.put(extra).unwrap();
    match sink.trade(&mut ready, &mut completed) {
        Err(XferError::Overrun) => {}
        other => panic!("expected overrun, got {other:?}"),
    }
}

#[test]
fn test_source_marks_partial_final_buffer() {
    // One line into 23/24/25-byte buffers: the last buffer is partial.
    let mut source = Terminal::Source(Source::new(1));
    let mut ready = Fifo::new(8);
    let mut completed = Fifo::new(8);
    for cap in [23usize, 24, 25, 26] {
        ready.put(ByteBuf::new(cap)).unwrap();
    }
    source.trade(&mut ready, &mut completed).unwrap();
    assert!(source.eof());
    let sizes: Vec<usize> = {
        let mut v = Vec::new();
        while let Some(b) = completed.get() {
            v.push(b.nused);
        }
        v
    };
    assert_eq!(sizes.iter().sum::<usize>(), 78);
    assert_eq!(sizes, vec![23, 24, 25, 6]);
}
