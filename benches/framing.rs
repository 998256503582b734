//! Benchmarks for the hot byte paths: CRC16, client framing and the
//! transaction queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use modbus_rtu_bridge::protocol::{encode_rtu_frame, FrameHeader, Session};
use modbus_rtu_bridge::{crc, ClientHandle, Framer, TransactionQueue, MAX_PDU_SIZE};

fn tcp_frame(transaction_id: u16, pdu_len: usize) -> Vec<u8> {
    let header = FrameHeader {
        transaction_id,
        protocol_id: 0,
        length: (pdu_len + 1) as u16,
        unit_id: 0x11,
    };
    let mut frame = header.encode().to_vec();
    frame.extend((0..pdu_len).map(|i| i as u8));
    frame
}

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");
    for size in [8usize, 64, 256] {
        let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| crc::crc16(black_box(data)))
        });
    }
    group.finish();

    let frame = encode_rtu_frame(0x11, &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]);
    c.bench_function("crc16_check_response", |b| b.iter(|| crc::check(black_box(&frame))));
}

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");
    for chunk in [1usize, 16, 512] {
        // eight pipelined read requests per pass
        let stream: Vec<u8> = (0..8).flat_map(|tid| tcp_frame(tid, 5)).collect();
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &stream, |b, stream| {
            b.iter(|| {
                let mut framer = Framer::new(512);
                let mut frames = 0;
                for piece in stream.chunks(chunk) {
                    let span = framer.recv_span();
                    let n = piece.len().min(span.len());
                    span[..n].copy_from_slice(&piece[..n]);
                    framer.on_bytes_received(n).unwrap();
                    while let Some(frame) = framer.frame() {
                        black_box(frame);
                        framer.consume().unwrap();
                        frames += 1;
                    }
                }
                frames
            })
        });
    }
    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let queue = TransactionQueue::new(4096);
    let header = FrameHeader::decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11]);
    let session = Session::from_header(ClientHandle::new(0, 0), &header);
    let small = [0x03, 0x00, 0x6B, 0x00, 0x03];
    let large = vec![0x10; MAX_PDU_SIZE];

    c.bench_function("queue_round_trip_small", |b| {
        b.iter(|| {
            queue.try_enqueue(&session, black_box(&small));
            queue.try_dequeue()
        })
    });
    c.bench_function("queue_round_trip_max_pdu", |b| {
        b.iter(|| {
            queue.try_enqueue(&session, black_box(&large));
            queue.try_dequeue()
        })
    });
}

criterion_group!(benches, bench_crc, bench_framer, bench_queue);
criterion_main!(benches);
