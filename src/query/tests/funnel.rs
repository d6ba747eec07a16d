#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use arrow::record_batch::RecordBatch;
    use chrono::TimeZone;
    use chrono::Utc;
    use common::funnel::Attribution;
    use common::funnel::BreakdownSpec;
    use common::funnel::BreakdownType;
    use common::funnel::Exclusion;
    use common::funnel::Funnel;
    use common::funnel::OrderType;
    use common::funnel::StepEntity;
    use common::funnel::StepMath;
    use common::funnel::VizMode;
    use common::query::PropertyRef;
    use common::query::TimeIntervalUnit;
    use common::types::ALL_USERS_COHORT;
    use query::actors;
    use query::actors::ActorsRequest;
    use query::aggregate;
    use query::exec;
    use query::exec::ActorResult;
    use query::funnel;
    use query::test_util::actor_result;
    use query::test_util::build_ctx;
    use query::test_util::ctx_fixture;
    use query::test_util::events_batch;
    use query::test_util::events_batch_with_prop;
    use query::test_util::sequential_spec;
    use query::test_util::InMemoryActions;
    use query::test_util::InMemoryCohorts;
    use query::test_util::PassthroughProperties;
    use query::QueryContext;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;
    use tracing_test::traced_test;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 86_400_000;

    fn t0() -> i64 {
        Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn run(ctx: &QueryContext, batch: &RecordBatch) -> Vec<ActorResult> {
        let mut eval = exec::Funnel::try_new(exec::Options::from_context(ctx)).unwrap();
        eval.evaluate(batch).unwrap();
        eval.finalize().unwrap()
    }

    #[derive(Debug)]
    struct TestCase {
        name: &'static str,
        spec: Funnel,
        data: Vec<(i64, i64, &'static str)>,
        /// `(actor, steps, conversion times)` per expected result row.
        exp: Vec<(i64, usize, Vec<Option<i64>>)>,
    }

    #[traced_test]
    #[test]
    fn engine_cases() -> anyhow::Result<()> {
        let excluded_spec = {
            let mut spec = sequential_spec(&["a", "b"]);
            spec.exclusions = vec![Exclusion {
                entity: StepEntity::Event("x".to_string()),
                filters: None,
                from_step: 0,
                to_step: 1,
            }];
            spec
        };
        let strict_spec = {
            let mut spec = sequential_spec(&["a", "b"]);
            spec.order = OrderType::Strict;
            spec
        };
        let unordered_spec = {
            let mut spec = sequential_spec(&["a", "b"]);
            spec.order = OrderType::Unordered;
            spec
        };

        let cases = vec![
            TestCase {
                name: "three steps in a row convert",
                spec: sequential_spec(&["a", "b", "c"]),
                data: vec![
                    (1, t0(), "a"),
                    (1, t0() + HOUR, "b"),
                    (1, t0() + 2 * HOUR, "c"),
                ],
                exp: vec![(1, 3, vec![None, Some(3600), Some(3600)])],
            },
            TestCase {
                // the §-style boundary scenario: the chain is anchored at
                // the entry, so the third event lands outside the window
                name: "window excludes the late step",
                spec: sequential_spec(&["a", "b", "c"]),
                data: vec![
                    (1, t0(), "a"),
                    (1, t0() + DAY, "b"),
                    (1, t0() + 10 * DAY, "c"),
                ],
                exp: vec![(1, 2, vec![None, Some(86400), None])],
            },
            TestCase {
                name: "interleaving exclusion discards progress",
                spec: excluded_spec,
                data: vec![
                    (1, t0(), "a"),
                    (1, t0() + HOUR, "x"),
                    (1, t0() + 2 * HOUR, "b"),
                ],
                exp: vec![(1, 1, vec![None, None])],
            },
            TestCase {
                name: "strict order breaks on an off-path event",
                spec: strict_spec,
                data: vec![
                    (1, t0(), "a"),
                    (1, t0() + HOUR, "x"),
                    (1, t0() + 2 * HOUR, "b"),
                    (2, t0(), "a"),
                    (2, t0() + HOUR, "b"),
                ],
                exp: vec![(1, 1, vec![None, None]), (2, 2, vec![None, Some(3600)])],
            },
            TestCase {
                name: "unordered accepts out-of-order arrivals",
                spec: unordered_spec,
                data: vec![(1, t0(), "b"), (1, t0() + HOUR, "a")],
                exp: vec![(1, 2, vec![None, Some(3600)])],
            },
            TestCase {
                name: "duplicate steps advance strictly",
                spec: sequential_spec(&["a", "a"]),
                data: vec![(1, t0(), "a"), (1, t0() + HOUR, "a")],
                exp: vec![(1, 2, vec![None, Some(3600)])],
            },
            TestCase {
                name: "duplicate steps reject the same instant",
                spec: sequential_spec(&["a", "a"]),
                data: vec![(1, t0(), "a"), (1, t0(), "a")],
                exp: vec![(1, 1, vec![None, None])],
            },
            TestCase {
                name: "distinct steps may share a timestamp",
                spec: sequential_spec(&["a", "b"]),
                data: vec![(1, t0(), "a"), (1, t0(), "b")],
                exp: vec![(1, 2, vec![None, Some(0)])],
            },
        ];

        for case in cases {
            let ctx = build_ctx(case.spec);
            let batch = events_batch(&case.data);
            let mut results = run(&ctx, &batch);
            results.sort_by_key(|r| r.actor_id);
            let got: Vec<(i64, usize, Vec<Option<i64>>)> = results
                .into_iter()
                .map(|r| (r.actor_id, r.steps, r.conversion_times))
                .collect();
            assert_eq!(got, case.exp, "case failed: {}", case.name);
        }

        Ok(())
    }

    #[test]
    fn first_time_math_counts_only_the_first_occurrence() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.steps[1].math = StepMath::FirstTimeForActor;
        let ctx = build_ctx(spec);

        // actor 1's first "b" predates the funnel entry; the later one no
        // longer qualifies
        let batch = events_batch(&[
            (1, t0(), "b"),
            (1, t0() + HOUR, "a"),
            (1, t0() + 2 * HOUR, "b"),
            (2, t0(), "a"),
            (2, t0() + HOUR, "b"),
        ]);
        let mut results = run(&ctx, &batch);
        results.sort_by_key(|r| r.actor_id);
        assert_eq!(results[0].steps, 1);
        assert_eq!(results[1].steps, 2);
    }

    #[test]
    fn holding_constants_pin_chains_to_one_value() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.holding_constants = Some(vec![PropertyRef::Event("plan".to_string())]);
        let ctx = build_ctx(spec);

        let batch = events_batch_with_prop("plan", &[
            (1, t0(), "a", Some("free")),
            (1, t0() + HOUR, "b", Some("pro")),
            (2, t0(), "a", Some("pro")),
            (2, t0() + HOUR, "b", Some("pro")),
        ]);
        let mut results = run(&ctx, &batch);
        results.sort_by_key(|r| r.actor_id);
        assert_eq!(results[0].steps, 1, "cross-value chain must not convert");
        assert_eq!(results[1].steps, 2);
    }

    fn breakdown_spec(attribution: Attribution) -> BreakdownSpec {
        BreakdownSpec {
            typ: BreakdownType::EventProperty,
            properties: vec![PropertyRef::Event("plan".to_string())],
            attribution,
            normalize_url: false,
            limit: None,
            cohort_ids: vec![],
        }
    }

    #[test]
    fn first_and_last_touch_attribution() {
        let data = vec![
            (1, t0(), "a", Some("free")),
            (1, t0() + HOUR, "b", Some("pro")),
        ];

        let mut spec = sequential_spec(&["a", "b"]);
        spec.breakdown = Some(breakdown_spec(Attribution::FirstTouch));
        let results = run(&build_ctx(spec), &events_batch_with_prop("plan", &data));
        assert_eq!(results[0].breakdown, Some(vec!["free".to_string()]));

        let mut spec = sequential_spec(&["a", "b"]);
        spec.breakdown = Some(breakdown_spec(Attribution::LastTouch));
        let results = run(&build_ctx(spec), &events_batch_with_prop("plan", &data));
        assert_eq!(results[0].breakdown, Some(vec!["pro".to_string()]));
    }

    #[test]
    fn all_events_attribution_yields_one_row_per_value() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.breakdown = Some(breakdown_spec(Attribution::AllEvents));
        let ctx = build_ctx(spec);

        let batch = events_batch_with_prop("plan", &[
            (1, t0(), "a", Some("free")),
            (1, t0() + HOUR, "b", Some("free")),
            (1, t0() + 2 * HOUR, "a", Some("pro")),
        ]);
        let results = run(&ctx, &batch);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].breakdown, Some(vec!["free".to_string()]));
        assert_eq!(results[0].steps, 2);
        assert_eq!(results[1].breakdown, Some(vec!["pro".to_string()]));
        assert_eq!(results[1].steps, 1);
    }

    #[test]
    fn cohort_breakdown_includes_the_all_users_cohort() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.breakdown = Some(BreakdownSpec {
            typ: BreakdownType::Cohort,
            properties: vec![],
            attribution: Attribution::FirstTouch,
            normalize_url: false,
            limit: None,
            cohort_ids: vec![ALL_USERS_COHORT, 5],
        });
        let mut cohorts = InMemoryCohorts::default();
        cohorts.insert(5, &[1]);
        let ctx = QueryContext::build(
            ctx_fixture(),
            spec,
            &InMemoryActions::default(),
            &cohorts,
            &PassthroughProperties,
        )
        .unwrap();

        let batch = events_batch(&[
            (1, t0(), "a"),
            (1, t0() + HOUR, "b"),
            (2, t0(), "a"),
        ]);
        let opts = exec::Options::from_context(&ctx)
            .with_cohorts(vec![(ALL_USERS_COHORT, vec![]), (5, vec![1])]);
        let mut eval = exec::Funnel::try_new(opts).unwrap();
        eval.evaluate(&batch).unwrap();
        let mut results = eval.finalize().unwrap();
        results.sort_by_key(|r| (r.actor_id, r.breakdown.clone()));

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].breakdown, Some(vec!["0".to_string()]));
        assert_eq!(results[1].breakdown, Some(vec!["5".to_string()]));
        assert_eq!(results[2].actor_id, 2);
        assert_eq!(results[2].breakdown, Some(vec!["0".to_string()]));
    }

    #[test]
    fn step_counts_roll_up_from_the_engine() {
        let ctx = build_ctx(sequential_spec(&["a", "b", "c"]));
        let batch = events_batch(&[
            (1, t0(), "a"),
            (1, t0() + HOUR, "b"),
            (1, t0() + 2 * HOUR, "c"),
            (2, t0(), "a"),
            (2, t0() + HOUR, "b"),
            (3, t0(), "a"),
        ]);
        let results = run(&ctx, &batch);
        let agg = aggregate::steps::from_actors(&ctx, &results).unwrap();
        assert_eq!(agg.totals.total, vec![3, 2, 1]);
        assert_eq!(agg.totals.exact, vec![1, 1, 1]);
        assert_eq!(agg.totals.avg_time_to_convert[1], Some(3600.0));
    }

    #[test]
    fn breakdown_overflow_collapses_into_other() {
        let mut spec = sequential_spec(&["a", "b"]);
        spec.breakdown = Some(BreakdownSpec {
            limit: Some(2),
            ..breakdown_spec(Attribution::FirstTouch)
        });
        let ctx = build_ctx(spec);

        // five values ranked 50/40/30/20/10 by entry reach
        let mut actors = vec![];
        let mut id = 0i64;
        for (value, count) in [("v1", 50), ("v2", 40), ("v3", 30), ("v4", 20), ("v5", 10)] {
            for _ in 0..count {
                id += 1;
                let mut actor = actor_result(id, 1, &[None, None]);
                actor.breakdown = Some(vec![value.to_string()]);
                actors.push(actor);
            }
        }
        let agg = aggregate::steps::from_actors(&ctx, &actors).unwrap();
        let buckets: Vec<(Option<Vec<String>>, i64)> = agg
            .buckets
            .iter()
            .map(|b| (b.breakdown.clone(), b.total[0]))
            .collect();
        assert_eq!(buckets, vec![
            (Some(vec!["v1".to_string()]), 50),
            (Some(vec!["v2".to_string()]), 40),
            (Some(vec!["Other".to_string()]), 60),
        ]);
        assert_eq!(agg.totals.total[0], 150);
    }

    #[test]
    fn time_to_convert_histogram_is_dense() {
        let ctx = build_ctx(sequential_spec(&["a", "b", "c"]));
        let batch = events_batch(&[
            (1, t0(), "a"),
            (1, t0() + 100_000, "b"),
            (1, t0() + 200_000, "c"),
            (2, t0(), "a"),
            (2, t0() + 300_000, "b"),
            (2, t0() + 600_000, "c"),
            (3, t0(), "a"),
        ]);
        let results = run(&ctx, &batch);
        let agg = aggregate::time_to_convert::from_actors(&ctx, &results).unwrap();

        // totals 200s and 600s; auto bins = ceil(cbrt(2)) = 2
        assert_eq!(agg.sample_count, 2);
        assert_eq!(agg.bin_width, 200);
        assert_eq!(agg.bins.len(), 3);
        assert_eq!(
            agg.bins.iter().map(|b| (b.lower, b.count)).collect::<Vec<_>>(),
            vec![(200, 1), (400, 0), (600, 1)]
        );
        assert_eq!(agg.average_seconds, Some(400.0));
    }

    #[test]
    fn trends_fill_covers_every_period() {
        let ctx = build_ctx(sequential_spec(&["a", "b"]));
        let batch = events_batch(&[
            (1, t0(), "a"),
            (1, t0() + HOUR, "b"),
            (2, t0(), "a"),
            (3, t0() + 3 * DAY, "a"),
            (3, t0() + 3 * DAY + HOUR, "b"),
        ]);
        let results = run(&ctx, &batch);
        let agg = aggregate::trends::from_actors(&ctx, &results).unwrap();

        // the range is January, daily: 31 rows, zero-filled
        assert_eq!(agg.rows.len(), 31);
        assert_eq!(agg.rows[0].reached_from, 0);
        assert_eq!(agg.rows[0].conversion_rate, 0.0);
        assert_eq!(agg.rows[1].reached_from, 2);
        assert_eq!(agg.rows[1].reached_to, 1);
        assert_eq!(agg.rows[1].conversion_rate, 50.0);
        assert_eq!(agg.rows[4].reached_from, 1);
        assert_eq!(agg.rows[4].conversion_rate, 100.0);
    }

    #[test]
    fn correlation_separates_both_sides() {
        let ctx = build_ctx(sequential_spec(&["a", "b"]));
        let mut actors = vec![];
        for id in 0..100i64 {
            let success = id < 30;
            let mut actor = actor_result(id, if success { 2 } else { 1 }, &[None, None]);
            let mut seen = vec!["a".to_string()];
            // "help" leans success, "noise" leans failure
            if (success && id < 20) || (!success && id < 35) {
                seen.push("help".to_string());
            }
            if (success && id >= 20) || (!success && id >= 60) {
                seen.push("noise".to_string());
            }
            actor.events_seen = seen;
            actors.push(actor);
        }
        let agg = aggregate::correlation::from_actors(&ctx, &actors).unwrap();

        assert!(!agg.skewed);
        assert!(agg.success.iter().any(|r| r.event == "help"));
        assert!(agg.success.iter().all(|r| r.odds_ratio > 1.0));
        assert!(agg.failure.iter().any(|r| r.event == "noise"));
        assert!(agg.failure.iter().all(|r| r.odds_ratio < 1.0));
    }

    /// Literal transcription of the cascading fold: seed the per-row
    /// latests, fold one windowed minimum per level over the rows after
    /// the current one, then close the chain on every candidate entry.
    fn cascading_oracle(events: &[(i64, &str)], steps: &[&str], window_ms: i64) -> usize {
        let k = steps.len();
        let m = events.len();
        let flag = |i: usize, p: usize| events[p].1 == steps[i];
        let mut latest: Vec<Vec<Option<i64>>> = (0..k)
            .map(|i| {
                (0..m)
                    .map(|p| if flag(i, p) { Some(events[p].0) } else { None })
                    .collect()
            })
            .collect();
        for level in 2..=k {
            for i in (level - 1)..k {
                let prev = latest[i].clone();
                for p in 0..m {
                    latest[i][p] = (p + 1..m).filter_map(|q| prev[q]).min();
                }
            }
        }

        let mut best = 0;
        for p in 0..m {
            if !flag(0, p) {
                continue;
            }
            let entry = events[p].0;
            let mut reached = 1;
            for j in 1..k {
                let ok = match (latest[j - 1][p], latest[j][p]) {
                    (Some(prev), Some(cur)) => {
                        let ordered = if steps[j] == steps[j - 1] {
                            prev < cur
                        } else {
                            prev <= cur
                        };
                        ordered && cur <= entry + window_ms
                    }
                    _ => false,
                };
                if ok {
                    reached = j + 1;
                } else {
                    break;
                }
            }
            best = best.max(reached);
        }

        best
    }

    fn random_streams(
        rng: &mut StdRng,
        alphabet: &[&'static str],
        actors: i64,
    ) -> Vec<Vec<(i64, &'static str)>> {
        (0..actors)
            .map(|_| {
                let len = rng.gen_range(0..12);
                let mut events: Vec<(i64, &'static str)> = (0..len)
                    .map(|_| {
                        let ts = t0() + rng.gen_range(0..20 * DAY);
                        (ts, alphabet[rng.gen_range(0..alphabet.len())])
                    })
                    .collect();
                events.sort_by_key(|e| e.0);
                events
            })
            .collect()
    }

    fn batch_of_streams(streams: &[Vec<(i64, &'static str)>]) -> RecordBatch {
        let rows: Vec<(i64, i64, &str)> = streams
            .iter()
            .enumerate()
            .flat_map(|(actor, events)| {
                events
                    .iter()
                    .map(move |&(ts, name)| (actor as i64 + 1, ts, name))
            })
            .collect();

        events_batch(&rows)
    }

    #[test]
    fn sequential_engine_matches_the_cascading_oracle() {
        let steps = ["e1", "e2", "e3"];
        let alphabet = ["e1", "e2", "e3", "x"];
        let mut rng = StdRng::seed_from_u64(42);
        let spec = sequential_spec(&steps);
        let window_ms = spec.conversion_window.seconds() * 1000;

        for _ in 0..50 {
            let streams = random_streams(&mut rng, &alphabet, 8);
            let ctx = build_ctx(spec.clone());
            let results = run(&ctx, &batch_of_streams(&streams));
            let by_actor: HashMap<i64, usize> =
                results.iter().map(|r| (r.actor_id, r.steps)).collect();

            for (actor, events) in streams.iter().enumerate() {
                let expected = cascading_oracle(events, &steps, window_ms);
                let got = by_actor.get(&(actor as i64 + 1)).copied().unwrap_or(0);
                assert_eq!(got, expected, "actor stream {events:?}");
            }
        }
    }

    #[test]
    fn unordered_engine_equals_the_rotation_maximum() {
        let alphabet = ["e1", "e2", "e3", "e4", "x"];
        let mut rng = StdRng::seed_from_u64(7);

        for steps in [vec!["e1", "e2", "e3"], vec!["e1", "e2", "e3", "e4"]] {
            let mut spec = sequential_spec(&steps);
            spec.order = OrderType::Unordered;
            let window_ms = spec.conversion_window.seconds() * 1000;

            for _ in 0..30 {
                let streams = random_streams(&mut rng, &alphabet, 6);
                let ctx = build_ctx(spec.clone());
                let results = run(&ctx, &batch_of_streams(&streams));
                let by_actor: HashMap<i64, usize> =
                    results.iter().map(|r| (r.actor_id, r.steps)).collect();

                for (actor, events) in streams.iter().enumerate() {
                    let expected = (0..steps.len())
                        .map(|rotation| {
                            let rotated: Vec<&str> = steps[rotation..]
                                .iter()
                                .chain(steps[..rotation].iter())
                                .copied()
                                .collect();
                            cascading_oracle(events, &rotated, window_ms)
                        })
                        .max()
                        .unwrap();
                    let got = by_actor.get(&(actor as i64 + 1)).copied().unwrap_or(0);
                    assert_eq!(got, expected, "actor stream {events:?}");
                }
            }
        }
    }

    #[test]
    fn conversion_times_never_exceed_the_window() {
        let steps = ["e1", "e2", "e3"];
        let alphabet = ["e1", "e2", "e3", "x"];
        let mut rng = StdRng::seed_from_u64(99);

        for _ in 0..40 {
            let hours = rng.gen_range(1..48);
            let mut spec = sequential_spec(&steps);
            spec.conversion_window = common::funnel::ConversionWindow {
                n: hours,
                unit: TimeIntervalUnit::Hour,
            };
            let window_secs = spec.conversion_window.seconds();

            let streams = random_streams(&mut rng, &alphabet, 6);
            let ctx = build_ctx(spec);
            for result in run(&ctx, &batch_of_streams(&streams)) {
                assert!(result.steps >= 1);
                for ct in result.conversion_times.iter().flatten() {
                    assert!(
                        *ct <= window_secs,
                        "conversion time {ct}s exceeds the {window_secs}s window"
                    );
                }
            }
        }
    }

    #[test]
    fn compilation_is_idempotent() -> anyhow::Result<()> {
        let mut spec = sequential_spec(&["a", "b", "c"]);
        spec.viz = VizMode::Trends;
        spec.breakdown = Some(BreakdownSpec {
            limit: Some(2),
            ..breakdown_spec(Attribution::FirstTouch)
        });
        spec.exclusions = vec![Exclusion {
            entity: StepEntity::Event("x".to_string()),
            filters: None,
            from_step: 0,
            to_step: 2,
        }];

        let a = build_ctx(spec.clone());
        let b = build_ctx(spec);
        assert_eq!(funnel::build(&a)?, funnel::build(&b)?);
        assert_eq!(funnel::build_correlation(&a)?, funnel::build_correlation(&b)?);

        let req = ActorsRequest {
            step: -2,
            breakdown: Some(vec!["free".to_string()]),
            with_events: true,
            time_to_convert: None,
        };
        assert_eq!(actors::build(&a, &req)?, actors::build(&b, &req)?);

        Ok(())
    }
}
