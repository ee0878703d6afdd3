//! On-disk lease record codec overhead benchmarking.

use std::fmt;
use std::time::Duration;

use sectorlock::disk::Geometry;
use sectorlock::ondisk::{LeaderRecord, LeaseKind, PaxosDblock};
use sectorlock::SectorlockError;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

static SECTORS: [u32; 2] = [512, 4096];

struct BenchId(pub &'static str, pub u32);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.0, self.1)
    }
}

fn sample_leader(sector: u32) -> Result<LeaderRecord, SectorlockError> {
    let geometry = Geometry::new(None, Some(sector))?;
    let mut leader =
        LeaderRecord::new_free(LeaseKind::Paxos, &geometry, "space", "resource");
    leader.owner_id = 17;
    leader.owner_generation = 3;
    leader.lver = 12345;
    leader.timestamp = 1_700_000_000;
    Ok(leader)
}

fn leader_round(sector: u32) -> Result<(), SectorlockError> {
    let mut leader = sample_leader(sector)?;
    let buf = leader.encode_sector(sector);
    let decoded = LeaderRecord::decode(&buf, LeaseKind::Paxos)?;
    black_box(decoded);
    Ok(())
}

fn dblock_round(sector: u32) -> Result<(), SectorlockError> {
    let mut dblock = PaxosDblock {
        mbal: 2001,
        bal: 2001,
        inp: 17,
        inp2: 3,
        inp3: 1_700_000_000,
        lver: 12346,
        ..Default::default()
    };
    let buf = dblock.encode_sector(sector);
    let decoded = PaxosDblock::decode(&buf)?;
    black_box(decoded);
    Ok(())
}

fn codec_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for sector in SECTORS {
        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId("leader", sector)),
            &sector,
            |b, &sector| {
                b.iter(|| leader_round(sector));
            },
        );
        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId("dblock", sector)),
            &sector,
            |b, &sector| {
                b.iter(|| dblock_round(sector));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, codec_bench_group);
criterion_main!(benches);
