//! Decoder throughput: the transform stage parses every change the
//! receiver lands, so the plugin parsers are the hot path of catchup.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use pg_shuttle::cdc::record;
use pg_shuttle::cdc::transform::statement_for;
use pg_shuttle::config::Plugin;
use pg_shuttle::lsn::Lsn;

const WAL2JSON_INSERT: &str = r#"{"action":"I","schema":"public","table":"orders","columns":[
    {"name":"id","type":"bigint","value":982451653},
    {"name":"customer_id","type":"integer","value":31337},
    {"name":"status","type":"text","value":"shipped"},
    {"name":"total","type":"numeric(12,2)","value":"1249.99"},
    {"name":"note","type":"text","value":"it's a gift, don't include the invoice"},
    {"name":"placed_at","type":"timestamp with time zone","value":"2026-02-17 10:00:00.123+00"}]}"#;

const TEST_DECODING_INSERT: &str = "table public.orders: INSERT: id[bigint]:982451653 \
     customer_id[integer]:31337 status[text]:'shipped' total[numeric(12,2)]:1249.99 \
     note[text]:'it''s a gift, don''t include the invoice' \
     placed_at[timestamp with time zone]:'2026-02-17 10:00:00.123+00'";

fn bench_parsers(c: &mut Criterion) {
    let lsn: Lsn = "16/B374D848".parse().unwrap();

    c.bench_function("wal2json_insert", |b| {
        b.iter(|| {
            record::parse(Plugin::Wal2Json, lsn, Some(761), black_box(WAL2JSON_INSERT)).unwrap()
        })
    });

    c.bench_function("test_decoding_insert", |b| {
        b.iter(|| {
            record::parse(
                Plugin::TestDecoding,
                lsn,
                Some(761),
                black_box(TEST_DECODING_INSERT),
            )
            .unwrap()
        })
    });
}

fn bench_statement_generation(c: &mut Criterion) {
    let lsn: Lsn = "16/B374D848".parse().unwrap();
    let rec = record::parse(Plugin::Wal2Json, lsn, Some(761), WAL2JSON_INSERT)
        .unwrap()
        .unwrap();
    let identity = vec!["id".to_string()];

    c.bench_function("upsert_statement", |b| {
        b.iter(|| statement_for(black_box(&rec), black_box(&identity)).unwrap())
    });
}

criterion_group!(benches, bench_parsers, bench_statement_generation);
criterion_main!(benches);
