use chrono::{TimeZone, Utc};
use nlq_engine::compiler::QueryCompiler;
use nlq_engine::extract::RuleBasedExtractor;
use nlq_engine::knowledge::{Clock, DomainKnowledgeBase, KnowledgeDefinition};
use nlq_engine::model::{
    ConflictType, EntityType, Filter, FilterOperator, Metric, QueryEntities, SortDirection,
};
use nlq_engine::resolver::EntityResolver;
use nlq_engine::NlqError;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;

/// Friday 2026-10-16
fn fixed_clock() -> Clock {
    Clock::Fixed(Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap())
}

fn gaming_kb() -> Arc<DomainKnowledgeBase> {
    Arc::new(DomainKnowledgeBase::gaming().with_clock(fixed_clock()))
}

struct Pipeline {
    extractor: RuleBasedExtractor,
    resolver: EntityResolver,
    compiler: QueryCompiler,
}

impl Pipeline {
    fn new(kb: Arc<DomainKnowledgeBase>) -> Self {
        Self {
            extractor: RuleBasedExtractor::new(&kb).unwrap(),
            resolver: EntityResolver::new(kb.clone()),
            compiler: QueryCompiler::new(kb),
        }
    }

    fn resolve(&self, text: &str) -> QueryEntities {
        let candidate = self.extractor.extract_entities(text);
        self.resolver.resolve(&candidate, text)
    }

    fn sql(&self, text: &str) -> String {
        let entities = self.resolve(text);
        assert!(entities.conflicts.is_empty(), "unexpected conflicts: {:?}", entities.conflicts);
        self.compiler.compile(&entities).unwrap()
    }
}

fn assert_parses(sql: &str) {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .unwrap_or_else(|e| panic!("generated SQL does not parse: {}\n{}", e, sql));
    assert_eq!(statements.len(), 1);
}

#[test]
fn test_deposits_for_uk_last_week_round_trip() {
    let sql = Pipeline::new(gaming_kb()).sql("show me deposits for UK last week");
    assert_eq!(
        sql,
        "SELECT Players.Country AS country, SUM(Payments.DepositAmount) AS deposits \
         FROM Transactions \
         JOIN Payments ON Transactions.TransactionId = Payments.TransactionId \
         JOIN Players ON Transactions.PlayerId = Players.PlayerId \
         WHERE Players.Country = 'UK' \
         AND Transactions.TransactionDate BETWEEN '2026-10-05' AND '2026-10-11' \
         GROUP BY Players.Country"
    );
    assert_parses(&sql);
}

#[test]
fn test_top_five_revenue_orders_descending() {
    let pipeline = Pipeline::new(gaming_kb());
    let entities = pipeline.resolve("top 5 revenue");
    assert_eq!(entities.limit, Some(5));
    assert_eq!(entities.sort_by.as_ref().unwrap().direction, SortDirection::Desc);

    let sql = pipeline.compiler.compile(&entities).unwrap();
    assert!(sql.ends_with("ORDER BY revenue DESC LIMIT 5"));
    assert_parses(&sql);
}

#[test]
fn test_generated_sql_parses() {
    let pipeline = Pipeline::new(gaming_kb());
    for question in [
        "revenue by partner this quarter",
        "average bet by game type for slots yesterday",
        "bottom 3 providers by rtp last 90 days",
        "active players by device excluding mobile",
        "ggr by white label and country from 2026-01-01 to 2026-03-31",
        "deposits by payment method this month vs last month",
    ] {
        let sql = pipeline.sql(question);
        assert!(sql.starts_with("SELECT "), "{}", question);
        assert_parses(&sql);
    }
}

#[test]
fn test_unknown_metric_needs_clarification() {
    let pipeline = Pipeline::new(gaming_kb());
    let mut candidate = QueryEntities::new();
    candidate.metrics.push(Metric::candidate("xyzzy123"));
    let entities = pipeline.resolver.resolve(&candidate, "xyzzy123");

    let metric = &entities.metrics[0];
    assert!(metric.is_unresolved);
    assert_eq!(metric.match_confidence, 0.0);
    assert_eq!(entities.conflicts.len(), 1);
    assert_eq!(entities.conflicts[0].conflict_type, ConflictType::Unknown);
    assert_eq!(entities.conflicts[0].entity_type, EntityType::Metric);
    assert_eq!(entities.conflicts[0].suggestions.len(), 5);

    assert!(matches!(
        pipeline.compiler.compile(&entities),
        Err(NlqError::Compilation(_))
    ));
}

#[test]
fn test_synonym_resolves_exactly() {
    let entities = Pipeline::new(gaming_kb()).resolve("avg bet by country");
    assert_eq!(entities.metrics[0].name, "average bet");
    assert_eq!(entities.metrics[0].match_confidence, 1.0);
    assert!(entities.conflicts.is_empty());
}

#[test]
fn test_invalid_filter_value_lists_canonical_values() {
    let pipeline = Pipeline::new(gaming_kb());
    let mut candidate = QueryEntities::new();
    candidate.metrics.push(Metric::candidate("revenue"));
    candidate.filters.push(Filter::equals("game type", "arcade"));
    let entities = pipeline.resolver.resolve(&candidate, "");

    assert_eq!(entities.conflicts.len(), 1);
    let conflict = &entities.conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::InvalidValue);
    assert_eq!(conflict.suggestions.len(), 6);
    assert!(conflict.suggestions.contains(&"Scratch Cards".to_string()));
}

#[test]
fn test_contains_filter_matches_wildcards_literally() {
    let pipeline = Pipeline::new(gaming_kb());
    let mut candidate = QueryEntities::new();
    candidate.metrics.push(Metric::candidate("deposits"));
    let mut campaign = Filter::equals("campaign", "50% bonus");
    campaign.operator = FilterOperator::Contains;
    candidate.filters.push(campaign);
    let entities = pipeline.resolver.resolve(&candidate, "");

    let sql = pipeline.compiler.compile(&entities).unwrap();
    assert!(sql.contains("Marketing.CampaignName LIKE '%50!% bonus%' ESCAPE '!'"));
    assert_parses(&sql);
}

#[test]
fn test_zero_metrics_never_compiles() {
    let pipeline = Pipeline::new(gaming_kb());
    assert!(matches!(
        pipeline.compiler.compile(&QueryEntities::new()),
        Err(NlqError::Compilation(_))
    ));
}

#[test]
fn test_extraction_is_total_over_odd_input() {
    let pipeline = Pipeline::new(gaming_kb());
    let inputs = [
        "",
        "   ",
        "???",
        "top",
        "by",
        "from to",
        "from 2026-13-45 to yesterday",
        "revenue revenue revenue",
        "'; DROP TABLE Players; --",
        "ünïcødé by ✓ for 🎰",
        "not not not uk",
        "top -5 revenue",
        "bottom 99999999999999999999 games",
    ];
    for input in inputs {
        let candidate = pipeline.extractor.extract_entities(input);
        let entities = pipeline.resolver.resolve(&candidate, input);
        assert!(!entities.metrics.is_empty(), "{:?}", input);
        assert!(entities.time_range.is_some(), "{:?}", input);
        if entities.conflicts.is_empty() {
            assert_parses(&pipeline.compiler.compile(&entities).unwrap());
        }
    }
}

#[test]
fn test_resolution_is_idempotent_end_to_end() {
    let pipeline = Pipeline::new(gaming_kb());
    let once = pipeline.resolve("top 3 deposit by brand for table games last month");
    let twice = pipeline.resolver.resolve(&once, "");
    assert_eq!(once, twice);
}

#[test]
fn test_knowledge_base_from_json() {
    let raw = r#"{
        "metrics": [
            {"key": "sales", "name": "Sales", "database_field": "Orders.Total",
             "synonyms": ["turnover"], "default_aggregation": "sum"}
        ],
        "dimensions": [
            {"key": "store", "name": "Store", "database_field": "Stores.Name",
             "synonyms": ["shop"]}
        ],
        "schema": {
            "base_table": "Orders",
            "date_column": "Orders.OrderDate",
            "joins": [
                {"table": "Stores", "from_table": "Orders",
                 "on": "Orders.StoreId = Stores.StoreId", "join_type": "left"}
            ]
        },
        "default_metric": "sales"
    }"#;
    let definition = KnowledgeDefinition::from_json_str(raw).unwrap();
    let kb = Arc::new(
        DomainKnowledgeBase::new(definition)
            .unwrap()
            .with_clock(fixed_clock()),
    );

    let sql = Pipeline::new(kb).sql("turnover by shop last month");
    assert_eq!(
        sql,
        "SELECT Stores.Name AS store, SUM(Orders.Total) AS sales \
         FROM Orders \
         LEFT JOIN Stores ON Orders.StoreId = Stores.StoreId \
         WHERE Orders.OrderDate BETWEEN '2026-09-01' AND '2026-09-30' \
         GROUP BY Stores.Name"
    );
    assert_parses(&sql);
}
