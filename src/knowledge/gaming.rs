//! Built-in online gaming dictionary.

use super::definition::{
    AllowedValue, DimensionDefinition, JoinRule, JoinType, KnowledgeDefinition, MetricDefinition,
    SchemaDefinition,
};
use crate::model::Aggregation;

fn metric(
    key: &str,
    name: &str,
    field: &str,
    aggregation: Aggregation,
    synonyms: &[&str],
) -> MetricDefinition {
    MetricDefinition {
        key: key.to_string(),
        name: name.to_string(),
        database_field: field.to_string(),
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        default_aggregation: aggregation,
    }
}

fn dimension(
    key: &str,
    name: &str,
    field: &str,
    synonyms: &[&str],
    allowed: &[(&str, &str)],
) -> DimensionDefinition {
    DimensionDefinition {
        key: key.to_string(),
        name: name.to_string(),
        database_field: field.to_string(),
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        allowed_values: allowed
            .iter()
            .map(|(key, value)| AllowedValue {
                key: key.to_string(),
                value: value.to_string(),
            })
            .collect(),
    }
}

fn join(table: &str, from_table: &str, on: &str) -> JoinRule {
    JoinRule {
        table: table.to_string(),
        from_table: from_table.to_string(),
        on: on.to_string(),
        join_type: JoinType::Inner,
    }
}

#[rustfmt::skip]
pub fn metrics() -> Vec<MetricDefinition> {
    use Aggregation::*;
    vec![
        metric("revenue", "Revenue", "Transactions.Amount", Sum,
            &["earnings", "income", "money", "sales"]),
        metric("ggr", "GGR", "Games.GrossGamingRevenue", Sum,
            &["gross gaming revenue", "gross revenue", "net gaming revenue", "net revenue"]),
        metric("deposits", "Deposits", "Payments.DepositAmount", Sum,
            &["deposit amount", "money in", "funds added"]),
        metric("withdrawals", "Withdrawals", "Payments.WithdrawalAmount", Sum,
            &["withdrawal amount", "money out", "cashouts"]),
        metric("registrations", "Registrations", "Players.RegistrationDate", Count,
            &["new players", "signups", "new registrations", "new accounts"]),
        metric("active players", "Active Players", "Sessions.PlayerId", DistinctCount,
            &["active users", "unique players", "players", "users"]),
        metric("average bet", "Average Bet", "GameActivity.BetAmount", Avg,
            &["avg bet", "mean bet", "bet average"]),
        metric("rtp", "RTP", "Games.ReturnToPlayer", Avg,
            &["return to player", "payback percentage", "payout percentage"]),
        metric("wagering", "Wagering", "GameActivity.BetAmount", Sum,
            &["total bets", "wagers", "bet amount", "turnover"]),
        metric("arpu", "ARPU", "Players.Revenue", Avg,
            &["average revenue per user", "average player value"]),
        metric("retention rate", "Retention Rate", "PlayerMetrics.RetentionRate", Avg,
            &["retention", "player retention", "stickiness"]),
        metric("rounds played", "Rounds Played", "GameActivity.RoundId", Count,
            &["game rounds", "spins", "hands played", "bets placed"]),
    ]
}

#[rustfmt::skip]
pub fn dimensions() -> Vec<DimensionDefinition> {
    vec![
        dimension("game", "Game", "Games.GameName",
            &["game name", "game title", "slot", "table game"], &[]),
        dimension("game type", "Game Type", "Games.GameType",
            &["game category", "type", "category"],
            &[
                ("slots", "Slots"),
                ("table games", "Table Games"),
                ("live dealer", "Live Dealer"),
                ("poker", "Poker"),
                ("bingo", "Bingo"),
                ("scratch cards", "Scratch Cards"),
            ]),
        dimension("provider", "Provider", "Games.ProviderName",
            &["game provider", "vendor", "supplier", "game studio"], &[]),
        dimension("country", "Country", "Players.Country",
            &["player country", "location", "region", "geo"], &[]),
        dimension("white label", "White Label", "WhiteLabels.Name",
            &["brand", "site", "casino brand", "skin"], &[]),
        dimension("partner", "Partner", "Partners.Name",
            &["operator", "client", "b2b client"], &[]),
        dimension("device", "Device", "Sessions.DeviceType",
            &["device type", "platform", "mobile/desktop"],
            &[("desktop", "Desktop"), ("mobile", "Mobile"), ("tablet", "Tablet")]),
        dimension("payment method", "Payment Method", "Payments.MethodName",
            &["payment type", "deposit method", "payment provider"], &[]),
        dimension("campaign", "Campaign", "Marketing.CampaignName",
            &["marketing campaign", "promotion", "offer"], &[]),
        dimension("player segment", "Player Segment", "Players.Segment",
            &["segment", "player type", "user segment", "player category"],
            &[
                ("vip", "VIP"),
                ("high roller", "High Roller"),
                ("regular", "Regular"),
                ("casual", "Casual"),
                ("inactive", "Inactive"),
                ("new", "New"),
            ]),
    ]
}

#[rustfmt::skip]
pub fn schema() -> SchemaDefinition {
    SchemaDefinition {
        base_table: "Transactions".to_string(),
        date_column: "Transactions.TransactionDate".to_string(),
        joins: vec![
            join("Players", "Transactions", "Transactions.PlayerId = Players.PlayerId"),
            join("Games", "Transactions", "Transactions.GameId = Games.GameId"),
            join("Payments", "Transactions", "Transactions.TransactionId = Payments.TransactionId"),
            join("WhiteLabels", "Transactions", "Transactions.WhitelabelId = WhiteLabels.WhitelabelId"),
            join("Partners", "WhiteLabels", "WhiteLabels.PartnerId = Partners.PartnerId"),
            join("Sessions", "Transactions", "Transactions.SessionId = Sessions.SessionId"),
            join("Marketing", "Players", "Players.PlayerId = Marketing.PlayerId"),
            join("GameActivity", "Transactions", "Transactions.TransactionId = GameActivity.TransactionId"),
            join("PlayerMetrics", "Players", "Players.PlayerId = PlayerMetrics.PlayerId"),
        ],
    }
}

pub fn definition() -> KnowledgeDefinition {
    KnowledgeDefinition {
        metrics: metrics(),
        dimensions: dimensions(),
        schema: schema(),
        default_metric: "revenue".to_string(),
        starter_metrics: vec![
            "revenue".to_string(),
            "deposits".to_string(),
            "active players".to_string(),
        ],
    }
}
