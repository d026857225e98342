// Property-based tests for the index building blocks.
//
// Each property runs against freshly generated random inputs:
// 1. PQ codes always round-trip: encode(decode(code)) == code
// 2. PQ estimates are nonnegative under L2
// 3. A built index passes structural validation and returns well-formed
//    results for arbitrary queries

use proptest::prelude::*;
use quiver_core::{DistanceKind, IndexOptions, SliceReader};
use quiver_index::pq::{self, PqCodec};
use quiver_index::VamanaIndex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

fn deterministic_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
    (0..n * dim)
        .map(|i| ((i as u64).wrapping_mul(seed.wrapping_add(7)) % 1000) as f32 / 250.0 - 2.0)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_pq_code_round_trip(
        sub_len in 1usize..=4,
        quantizers in 1usize..=6,
        count in 20usize..=120,
        seed in 0u64..1000,
    ) {
        let dim = sub_len * quantizers;
        let vectors = deterministic_vectors(count, dim, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let codec = PqCodec::fit(&vectors, count, dim, sub_len, DistanceKind::L2, &mut rng)
            .unwrap();

        for row in 0..count.min(10) {
            let vector = &vectors[row * dim..(row + 1) * dim];
            let code = codec.encode(vector);
            let decoded = codec.decode(&code);
            prop_assert_eq!(decoded.len(), dim);
            prop_assert_eq!(codec.encode(&decoded), code);
        }
    }

    #[test]
    fn prop_pq_estimates_nonnegative_under_l2(
        count in 20usize..=80,
        seed in 0u64..1000,
    ) {
        let dim = 6;
        let vectors = deterministic_vectors(count, dim, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let codec = PqCodec::fit(&vectors, count, dim, 2, DistanceKind::L2, &mut rng).unwrap();

        let query = deterministic_vectors(1, dim, seed.wrapping_add(1));
        let mut table = Vec::new();
        codec.lookup_table_into(&query, &mut table);
        for row in 0..count {
            let code = codec.encode(&vectors[row * dim..(row + 1) * dim]);
            prop_assert!(pq::estimate(&code, &table) >= 0.0);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_built_index_is_well_formed(
        n in 5usize..=40,
        partitions in 1usize..=3,
        seed in 0u64..100,
    ) {
        let dim = 4;
        let dir = TempDir::new().unwrap();
        let mut options = IndexOptions::new("prop", dim as u32, DistanceKind::L2);
        options.max_edges = 4;
        options.beam_width = 8;
        options.compression = 4;
        options.seed = seed;

        let reader = SliceReader::new(deterministic_vectors(n, dim, seed), dim).unwrap();
        let mut index = VamanaIndex::new(options, dir.path()).unwrap();
        index.build_index(partitions, &reader).unwrap();

        index.validate().unwrap();

        let query = deterministic_vectors(1, dim, seed.wrapping_add(31));
        let k = 6;
        let got = index.nearest(&query, k).unwrap();
        prop_assert!(got.len() <= k.min(n));
        let mut unique = got.clone();
        unique.sort_unstable();
        unique.dedup();
        prop_assert_eq!(unique.len(), got.len());
        prop_assert!(got.iter().all(|&id| (id as usize) < n));
    }
}
