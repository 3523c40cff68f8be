//! Performance benchmarks for the message codec and the retry schedule

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dnsmux::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use dnsmux::dns::edns::EdnsRecord;
use dnsmux::dns::protocol::{DnsClass, DnsPacket, DnsRecord, EncodeOptions, QueryType, RData};
use dnsmux::dns::resolver::generate_timeouts;
use dnsmux::dns::tsig::{self, TsigAlgorithm, TsigKey};

fn create_response(answers: usize) -> DnsPacket {
    let mut packet = DnsPacket::query("www.example.com", QueryType::A, DnsClass::In).reply();
    for i in 0..answers {
        packet.answers.push(DnsRecord::new(
            "www.example.com",
            QueryType::A,
            DnsClass::In,
            300,
            RData::A(Ipv4Addr::new(192, 0, 2, i as u8)),
        ));
    }
    packet.authorities.push(DnsRecord::new(
        "example.com",
        QueryType::Ns,
        DnsClass::In,
        86400,
        RData::Ns("ns1.example.com".to_string()),
    ));
    packet.set_edns(Some(EdnsRecord::new(1232)));
    packet
}

fn benchmark_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Message Encoding");

    for answers in [1, 8, 32] {
        let packet = create_response(answers);
        group.throughput(Throughput::Elements(answers as u64));

        group.bench_with_input(BenchmarkId::new("compressed", answers), &packet, |b, packet| {
            b.iter(|| black_box(packet.encode().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("canonical", answers), &packet, |b, packet| {
            b.iter(|| black_box(packet.encode_with(EncodeOptions::canonical()).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Message Decoding");

    for answers in [1, 8, 32] {
        let bytes = create_response(answers).encode().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(answers), &bytes, |b, bytes| {
            b.iter(|| black_box(DnsPacket::decode(black_box(bytes)).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_names(c: &mut Criterion) {
    let mut group = c.benchmark_group("Domain Names");

    for domain in ["com", "www.example.com", "a.very.deeply.nested.label.example.org"] {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname(domain, false, false).unwrap();
        let bytes = buffer.into_inner();

        group.bench_with_input(BenchmarkId::new("read", domain), &bytes, |b, bytes| {
            b.iter(|| {
                let mut buffer = BytePacketBuffer::new(bytes);
                let mut name = String::new();
                buffer.read_qname(&mut name).unwrap();
                black_box(name)
            });
        });
        group.bench_with_input(BenchmarkId::new("write", domain), &domain, |b, domain| {
            b.iter(|| {
                let mut buffer = VectorPacketBuffer::new();
                buffer.write_qname(domain, true, false).unwrap();
                black_box(buffer.into_inner())
            });
        });
    }

    group.finish();
}

fn benchmark_tsig(c: &mut Criterion) {
    let mut group = c.benchmark_group("TSIG");
    let key = TsigKey::new(
        "transfer.example",
        TsigAlgorithm::HmacSha256,
        b"0123456789abcdef".to_vec(),
    );
    let query = DnsPacket::query("example.com", QueryType::Soa, DnsClass::In);
    let signed = tsig::sign(&query, &key, None).unwrap();

    group.bench_function("sign", |b| {
        b.iter(|| black_box(tsig::sign(&query, &key, None).unwrap()));
    });
    group.bench_function("verify", |b| {
        b.iter(|| {
            let mut packet = DnsPacket::decode(&signed.bytes).unwrap();
            black_box(tsig::verify(&signed.bytes, &mut packet, &key, None).unwrap())
        });
    });

    group.finish();
}

fn benchmark_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("Retry Schedule");
    let start = Instant::now();

    for servers in [1, 3, 13] {
        group.bench_with_input(BenchmarkId::from_parameter(servers), &servers, |b, &servers| {
            b.iter(|| black_box(generate_timeouts(start, servers, 4, Duration::from_secs(5))));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_names,
    benchmark_tsig,
    benchmark_schedule
);
criterion_main!(benches);
