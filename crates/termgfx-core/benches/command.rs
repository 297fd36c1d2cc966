//! Command parsing benchmarks.
//!
//! Run with: cargo bench --package termgfx-core --bench command

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use termgfx_core::base64;
use termgfx_core::command::GraphicsCommand;

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_parse");

    let commands: [(&str, &[u8]); 4] = [
        ("transmit", b"a=T,i=123,f=32,s=640,v=480,t=d,m=1;QUJDREVGRw=="),
        ("put", b"a=p,i=42,p=7,x=10,y=20,w=300,h=200,c=80,r=24,C=1"),
        ("frame", b"a=f,i=9,f=24,s=64,v=64,c=2,r=3,z=-1,x=16,y=16,X=1,Y=4278190335"),
        ("delete", b"a=d,d=N,I=5"),
    ];

    for (name, data) in commands {
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| GraphicsCommand::parse(black_box(data)));
        });
    }
    group.finish();
}

fn bench_base64(c: &mut Criterion) {
    let mut group = c.benchmark_group("base64_decode");

    for size in [64usize, 4096, 65536] {
        let raw: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let encoded = encode(&raw);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}B", size), |b| {
            b.iter(|| base64::decode(black_box(encoded.as_bytes())));
        });
    }
    group.finish();
}

fn encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for chunk in data.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 { ALPHABET[(n >> 6) as usize & 63] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[n as usize & 63] as char } else { '=' });
    }
    out
}

criterion_group!(benches, bench_parse, bench_base64);
criterion_main!(benches);
