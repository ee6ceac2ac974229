use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use rill_client::Engine;
use rill_common::{EngineConfig, Result, Schema, SchemaField, Value};
use rill_execution::exec_node::ExecNode;
use rill_execution::in_memory::{InMemoryStream, StreamElement};
use rill_execution::materialize::{compile_expr, MaterializationContext};
use rill_execution::record::Record;
use rill_execution::source::SourceExecutor;
use rill_planner::{
    AggregateKind, AggregateSpec, Cardinality, Expr, Expression, LogicalPlan, NamedExpr, Node,
    SourceDescription, TriggerSpec,
};

/// In-memory source fixture: unqualified records plus optional event-time
/// field and interleaved watermarks. Pushed predicates are evaluated
/// natively by wrapping the scan in a filter, mirroring what a real source
/// does in its own query language.
struct FixtureSource {
    fields: Vec<String>,
    elements: Vec<StreamElement>,
    time_field: Option<String>,
    accept_equalities: bool,
}

impl FixtureSource {
    fn bounded(fields: &[&str], records: Vec<Record>) -> Self {
        FixtureSource {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            elements: records.into_iter().map(StreamElement::Record).collect(),
            time_field: None,
            accept_equalities: false,
        }
    }
}

impl SourceExecutor for FixtureSource {
    fn description(&self) -> SourceDescription {
        let mut available_filters = BTreeMap::new();
        if self.accept_equalities {
            use rill_planner::{FieldType, Relation};
            available_filters.insert(
                FieldType::Secondary,
                std::collections::BTreeSet::from([Relation::Equal]),
            );
            available_filters.insert(FieldType::Primary, std::collections::BTreeSet::new());
        }
        SourceDescription {
            primary_keys: vec![],
            available_filters,
            cardinality: Cardinality::BoundedFitsInLocalStorage,
            time_field: self.time_field.clone(),
        }
    }

    fn schema(&self) -> Result<Schema> {
        Ok(Schema::new(
            self.fields
                .iter()
                .map(|name| SchemaField {
                    name: name.clone(),
                    typ: rill_common::Type::Union(vec![
                        rill_common::Type::Int,
                        rill_common::Type::Float,
                        rill_common::Type::String,
                        rill_common::Type::Timestamp,
                    ]),
                })
                .collect(),
        ))
    }

    fn materialize(
        &self,
        ctx: &MaterializationContext,
        pushed: &[Expression],
        alias: &str,
    ) -> Result<Arc<dyn ExecNode>> {
        let requalify = |record: &Record| {
            let fields: Vec<String> = record
                .fields()
                .iter()
                .map(|f| format!("{alias}.{f}"))
                .collect();
            let mut out = Record::new(fields.into(), record.values().to_vec())
                .with_event_time(record.event_time);
            out.retraction = record.retraction;
            out.event_time_field = self.time_field.as_ref().map(|t| format!("{alias}.{t}"));
            out
        };
        let elements = self
            .elements
            .iter()
            .map(|element| match element {
                StreamElement::Record(record) => StreamElement::Record(requalify(record)),
                StreamElement::Watermark(t) => StreamElement::Watermark(*t),
            })
            .collect();
        let scan: Arc<dyn ExecNode> = Arc::new(InMemoryStream::with_elements(elements, true));
        match Expression::combine_conjuncts(pushed.to_vec()) {
            Some(predicate) => Ok(Arc::new(rill_execution::filter::FilterExec::new(
                compile_expr(&predicate, ctx)?,
                scan,
            ))),
            None => Ok(scan),
        }
    }

    fn push_down_predicates(
        &self,
        new: Vec<Expression>,
        pushed: Vec<Expression>,
    ) -> (Vec<Expression>, Vec<Expression>, bool) {
        if !self.accept_equalities {
            return (new, pushed, false);
        }
        let mut rejected = Vec::new();
        let mut new_pushed = pushed.clone();
        for predicate in new {
            let is_equality = matches!(
                &predicate,
                Expression::FunctionCall { name, args } if name == "=" && args.len() == 2
            );
            if is_equality {
                new_pushed.push(predicate);
            } else {
                rejected.push(predicate);
            }
        }
        let changed = new_pushed.len() > pushed.len();
        (rejected, new_pushed, changed)
    }
}

fn scan(name: &str, alias: &str) -> LogicalPlan {
    LogicalPlan::DataSource {
        name: name.to_string(),
        alias: alias.to_string(),
    }
}

fn var(name: &str) -> Expr {
    Expr::Variable(name.to_string())
}

fn cat(name: &str, livesleft: i64, ownerid: i64) -> Record {
    Record::from_slices(
        &["cat", "livesleft", "ownerid"],
        vec![
            Value::String(name.to_string()),
            Value::Int(livesleft),
            Value::Int(ownerid),
        ],
    )
}

fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(|r| r.values().to_vec());
    records
}

/// Age filter over a CSV file: `(5,a) (4,b) (3,c) (3,d) (2,e)` with
/// `age != 3` keeps `(5,a) (4,b) (2,e)` in input order.
#[test]
fn filter_over_csv_source() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"age, tag\n5, a\n4, b\n3, c\n3, d\n2, e\n")
        .unwrap();

    let mut options = rill_sources::Options::new();
    options.insert(
        "path".to_string(),
        serde_json::Value::String(file.path().display().to_string()),
    );
    let source = rill_sources::CsvSource::from_options(&options).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("people", Arc::new(source));

    let plan = LogicalPlan::Filter {
        predicate: Expr::relation(var("p.age"), "!=", Expr::Constant(Value::Int(3))),
        source: Box::new(scan("people", "p")),
    };

    let out = engine.collect(&plan).unwrap();
    let tags: Vec<&Value> = out.iter().map(|r| r.value("p.tag").unwrap()).collect();
    assert_eq!(
        tags,
        vec![
            &Value::String("a".to_string()),
            &Value::String("b".to_string()),
            &Value::String("e".to_string()),
        ]
    );
}

/// The retraction-heavy group-by batch, end to end.
#[test]
fn group_by_with_retractions() {
    let records = vec![
        cat("Buster", 9, 5),
        cat("Precious", 6, 4),
        cat("Precious", 6, 4).as_retraction(),
        cat("Precious", 6, 4),
        cat("Precious", 6, 4).as_retraction(),
        cat("Precious", 6, 4),
        cat("Precious", 6, 4).as_retraction(),
        cat("Precious", 5, 4),
        cat("Nala", 6, 3),
        cat("Tiger", 4, 3),
        cat("Tiger", 4, 3).as_retraction(),
        cat("Lucy", 4, 3),
    ];
    let fixture = FixtureSource::bounded(&["cat", "livesleft", "ownerid"], records);

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("cats", Arc::new(fixture));

    let plan = LogicalPlan::GroupBy {
        source: Box::new(scan("cats", "c")),
        key: vec![var("c.ownerid")],
        aggregates: vec![
            AggregateSpec::named(AggregateKind::Key, "c.ownerid", "ownerid"),
            AggregateSpec::named(AggregateKind::Avg, "c.livesleft", "livesleft_avg"),
            AggregateSpec::named(AggregateKind::Count, "c.livesleft", "livesleft_count"),
        ],
        trigger: TriggerSpec::Watermark,
    };

    let out = sorted(engine.collect(&plan).unwrap());
    let expected = sorted(vec![
        Record::from_slices(
            &["ownerid", "livesleft_avg", "livesleft_count"],
            vec![Value::Int(3), Value::Float(5.0), Value::Int(2)],
        ),
        Record::from_slices(
            &["ownerid", "livesleft_avg", "livesleft_count"],
            vec![Value::Int(4), Value::Float(5.0), Value::Int(1)],
        ),
        Record::from_slices(
            &["ownerid", "livesleft_avg", "livesleft_count"],
            vec![Value::Int(5), Value::Float(9.0), Value::Int(1)],
        ),
    ]);
    assert_eq!(out, expected);
}

fn window(seconds: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds as i64)
}

fn timed_cat(ownerid: i64, livesleft: i64, boundary: DateTime<Utc>) -> Record {
    Record::from_slices(
        &["ownerid", "livesleft", "t"],
        vec![
            Value::Int(ownerid),
            Value::Int(livesleft),
            Value::Timestamp(boundary),
        ],
    )
    .with_event_time(boundary)
    .with_event_time_field("t")
}

/// Windowed group-by: one row per (owner, window), each stamped with its
/// window boundary as event time, released as the watermark passes.
#[test]
fn windowed_group_by_emits_rows_at_window_boundaries() {
    let w1 = window(0);
    let w2 = window(60);
    let w3 = window(120);

    let elements = vec![
        StreamElement::Record(timed_cat(3, 6, w1)),
        StreamElement::Record(timed_cat(3, 4, w1)),
        StreamElement::Record(timed_cat(4, 5, w1)),
        StreamElement::Watermark(window(30)),
        StreamElement::Record(timed_cat(3, 8, w2)),
        StreamElement::Watermark(window(90)),
        StreamElement::Record(timed_cat(4, 2, w3)),
    ];
    let fixture = FixtureSource {
        fields: vec![
            "ownerid".to_string(),
            "livesleft".to_string(),
            "t".to_string(),
        ],
        elements,
        time_field: Some("t".to_string()),
        accept_equalities: false,
    };

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("cats", Arc::new(fixture));

    let plan = LogicalPlan::GroupBy {
        source: Box::new(scan("cats", "c")),
        key: vec![var("c.ownerid"), var("c.t")],
        aggregates: vec![
            AggregateSpec::named(AggregateKind::Key, "c.ownerid", "ownerid"),
            AggregateSpec::named(AggregateKind::Key, "c.t", "window_start"),
            AggregateSpec::named(AggregateKind::Avg, "c.livesleft", "livesleft_avg"),
            AggregateSpec::named(AggregateKind::Count, "c.livesleft", "livesleft_count"),
        ],
        trigger: TriggerSpec::Watermark,
    };

    let out = engine.collect(&plan).unwrap();
    assert_eq!(out.len(), 4);

    // Every row's event time is its window boundary.
    for record in &out {
        assert_eq!(
            Some(&Value::Timestamp(record.event_time)),
            record.value("window_start"),
        );
    }

    let row = |ownerid: i64, boundary: DateTime<Utc>| {
        out.iter()
            .find(|r| {
                r.value("ownerid") == Some(&Value::Int(ownerid))
                    && r.value("window_start") == Some(&Value::Timestamp(boundary))
            })
            .unwrap()
    };
    assert_eq!(row(3, w1).value("livesleft_avg"), Some(&Value::Float(5.0)));
    assert_eq!(row(3, w1).value("livesleft_count"), Some(&Value::Int(2)));
    assert_eq!(row(4, w1).value("livesleft_avg"), Some(&Value::Float(5.0)));
    assert_eq!(row(3, w2).value("livesleft_count"), Some(&Value::Int(1)));
    assert_eq!(row(4, w3).value("livesleft_avg"), Some(&Value::Float(2.0)));
}

/// Pushdown soundness: an accepted equality moves into the source, the
/// residual filter disappears from the plan, and the output rows match
/// what the un-pushed filter would have produced.
#[test]
fn accepted_predicates_move_into_the_source() {
    let records = vec![cat("Buster", 9, 5), cat("Nala", 5, 3), cat("Lucy", 3, 3)];
    let mut fixture = FixtureSource::bounded(&["cat", "livesleft", "ownerid"], records);
    fixture.accept_equalities = true;

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("cats", Arc::new(fixture));

    let plan = LogicalPlan::Filter {
        predicate: Expr::relation(var("c.ownerid"), "=", Expr::Constant(Value::Int(3))),
        source: Box::new(scan("cats", "c")),
    };

    let physical = engine.plan(&plan).unwrap();
    fn count_filters(node: &Node) -> usize {
        match node {
            Node::Filter { source, .. } => 1 + count_filters(source),
            Node::Shuffle(shuffle) => shuffle.sources.iter().map(count_filters).sum(),
            _ => 0,
        }
    }
    assert_eq!(count_filters(&physical), 0, "filter should be merged away");

    let out = engine.collect(&plan).unwrap();
    assert_eq!(out.len(), 2);
    assert!(out
        .iter()
        .all(|r| r.value("c.ownerid") == Some(&Value::Int(3))));
}

/// Equi-join across two registered sources.
#[test]
fn join_matches_rows_across_sources() {
    let owners = FixtureSource::bounded(
        &["id", "name"],
        vec![
            Record::from_slices(
                &["id", "name"],
                vec![Value::Int(3), Value::String("maya".to_string())],
            ),
            Record::from_slices(
                &["id", "name"],
                vec![Value::Int(7), Value::String("kim".to_string())],
            ),
        ],
    );
    let cats = FixtureSource::bounded(
        &["cat", "livesleft", "ownerid"],
        vec![cat("Nala", 5, 3), cat("Lucy", 3, 3), cat("Buster", 9, 5)],
    );

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("owners", Arc::new(owners));
    engine.register_source("cats", Arc::new(cats));

    let plan = LogicalPlan::Join {
        left: Box::new(scan("owners", "o")),
        right: Box::new(scan("cats", "c")),
        on: vec![(var("o.id"), var("c.ownerid"))],
    };

    let out = engine.collect(&plan).unwrap();
    assert_eq!(out.len(), 2);
    assert!(out
        .iter()
        .all(|r| r.value("o.name") == Some(&Value::String("maya".to_string()))));
}

/// Limit and offset consume from the shuffled merge of their child.
#[test]
fn limit_and_offset_compose() {
    let records: Vec<Record> = (0..10)
        .map(|i| Record::from_slices(&["n"], vec![Value::Int(i)]))
        .collect();
    let fixture = FixtureSource::bounded(&["n"], records);

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("numbers", Arc::new(fixture));

    let plan = LogicalPlan::Limit {
        count: Expr::Constant(Value::Int(3)),
        source: Box::new(LogicalPlan::Offset {
            count: Expr::Constant(Value::Int(4)),
            source: Box::new(scan("numbers", "t")),
        }),
    };

    let out = engine.collect(&plan).unwrap();
    let values: Vec<&Value> = out.iter().map(|r| r.value("t.n").unwrap()).collect();
    assert_eq!(values, vec![&Value::Int(4), &Value::Int(5), &Value::Int(6)]);
}

/// Distinct collapses duplicate rows from the source.
#[test]
fn distinct_deduplicates_rows() {
    let records = vec![cat("Nala", 5, 3), cat("Nala", 5, 3), cat("Buster", 9, 5)];
    let fixture = FixtureSource::bounded(&["cat", "livesleft", "ownerid"], records);

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("cats", Arc::new(fixture));

    let plan = LogicalPlan::Distinct {
        source: Box::new(scan("cats", "c")),
    };

    let out = engine.collect(&plan).unwrap();
    assert_eq!(out.len(), 2);
}

/// A sub-query used as an expression: each row is compared against the
/// single value the inner plan produces.
#[test]
fn subquery_expression_evaluates_inner_plan() {
    let cats = FixtureSource::bounded(
        &["cat", "livesleft", "ownerid"],
        vec![cat("Nala", 5, 3), cat("Buster", 9, 5)],
    );
    let thresholds = FixtureSource::bounded(
        &["cutoff"],
        vec![Record::from_slices(&["cutoff"], vec![Value::Int(6)])],
    );

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_source("cats", Arc::new(cats));
    engine.register_source("thresholds", Arc::new(thresholds));

    let plan = LogicalPlan::Filter {
        predicate: Expr::relation(
            var("c.livesleft"),
            ">",
            Expr::Subquery(Box::new(LogicalPlan::Map {
                exprs: vec![NamedExpr::new(var("th.cutoff"))],
                keep: false,
                source: Box::new(scan("thresholds", "th")),
            })),
        ),
        source: Box::new(scan("cats", "c")),
    };

    let out = engine.collect(&plan).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(
        out[0].value("c.cat"),
        Some(&Value::String("Buster".to_string()))
    );
}
