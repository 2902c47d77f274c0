//! The coffee-shop analytics, expressed as a [`Topology`].
//!
//! Five results per session:
//!
//! - **Q1** `transaction_id, final_amount` of transactions in 2024-2025,
//!   between 06:00 and 23:00, with `final_amount >= 75`.
//! - **Q2** per `year_month` of 2024-2025, the best-selling item by summed
//!   `quantity` (`sellings_qty`) and by summed `subtotal` (`profit_sum`),
//!   named from the menu.
//! - **Q3** per store and `year_half` (same hours as Q1), total payment value
//!   `tpv`, named from the stores dataset.
//! - **Q4** per store, the customers with the most purchases in 2024-2025
//!   (`purchases_qty`), with their `birthdate` and the store's name.
//!
//! ```text
//!  TRN ─► filter_year_tx ─┬─► filter_hour_tx ─┬─► filter_amount_tx ─────────────► Q1
//!                         │                   └─► reduce_q3 ─► join_q3 ─────────► Q3
//!                         └─► reduce_q4 ─► topk_q4 ─► join_q4_users ─► join_q4_stores ─► Q4
//!  TIT ─► filter_items ─┬─► reduce_q2_quantity ─► topk_q2_quantity ─► join_q2_quantity ─► Q2Q
//!                       └─► reduce_q2_profit ───► topk_q2_profit ───► join_q2_profit ───► Q2P
//!  STR ─► clean_stores ─────► topic `stores`      (base of join_q3, join_q4_stores)
//!  USR ─► clean_users ──────► topic `users`       (base of join_q4_users)
//!  MNU ─► clean_menu_items ─► topic `menu_items`  (base of join_q2_*)
//! ```

use crate::combiners::{CountRows, SumField};
use crate::config::PipelineConfig;
use crate::message::Kind;
use crate::partition::ShardKey;
use crate::stages::transform::builtins::{
    at_least, date_only, integer_id, time_between, year_between, year_half, year_month,
};
use crate::stages::{JoinSpec, Step, TransformStage};
use crate::topology::{InputSpec, OutputSpec, RouteBy, StageSpec, Topology};
use chrono::NaiveTime;
use std::sync::Arc;

pub const FIRST_YEAR: i32 = 2024;
pub const LAST_YEAR: i32 = 2025;
pub const MIN_LARGE_AMOUNT: f64 = 75.0;

pub const STORES_TOPIC: &str = "stores";
pub const USERS_TOPIC: &str = "users";
pub const MENU_ITEMS_TOPIC: &str = "menu_items";

fn by_id(field: &str) -> RouteBy {
    RouteBy::Key(field.to_string(), ShardKey::Numeric)
}

fn by_text(field: &str) -> RouteBy {
    RouteBy::Key(field.to_string(), ShardKey::Text)
}

/// 06:00 to 23:00, both inclusive.
#[must_use]
pub fn business_hours() -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
        NaiveTime::from_hms_opt(23, 0, 0).unwrap_or_default(),
    )
}

/// The full coffee-shop topology, sized by `cfg`.
#[must_use]
pub fn coffee_shop(cfg: &PipelineConfig) -> Topology {
    let w = |name: &str| cfg.workers_for(name);
    let (open, close) = business_hours();

    let filter_year_tx = TransformStage::new(vec![
        Step::require(["transaction_id", "store_id", "final_amount", "created_at"]),
        Step::Map(integer_id("store_id")),
        Step::Map(integer_id("user_id")),
        Step::Filter(year_between("created_at", FIRST_YEAR, LAST_YEAR)),
        Step::Map(year_half("created_at", "year_half")),
        Step::project(["transaction_id", "store_id", "user_id", "final_amount", "created_at", "year_half"]),
    ]);
    let filter_hour_tx = TransformStage::new(vec![Step::Filter(time_between("created_at", open, close))]);
    let filter_amount_tx = TransformStage::new(vec![
        Step::Filter(at_least("final_amount", MIN_LARGE_AMOUNT)),
        Step::project(["transaction_id", "final_amount"]),
    ]);
    let filter_items = TransformStage::new(vec![
        Step::require(["item_id", "quantity", "subtotal", "created_at"]),
        Step::Map(integer_id("item_id")),
        Step::Filter(year_between("created_at", FIRST_YEAR, LAST_YEAR)),
        Step::Map(year_month("created_at", "year_month")),
        Step::project(["item_id", "quantity", "subtotal", "year_month"]),
    ]);
    let clean_stores = TransformStage::new(vec![
        Step::require(["store_id", "store_name"]),
        Step::Map(integer_id("store_id")),
        Step::project(["store_id", "store_name"]),
    ]);
    let clean_users = TransformStage::new(vec![
        Step::require(["user_id"]),
        Step::Map(integer_id("user_id")),
        Step::Map(date_only("birthdate")),
        Step::project(["user_id", "birthdate"]),
    ]);
    let clean_menu_items = TransformStage::new(vec![
        Step::require(["item_id", "item_name"]),
        Step::Map(integer_id("item_id")),
        Step::project(["item_id", "item_name"]),
    ]);

    let mut t = Topology::new(cfg.results_queue.clone(), cfg.max_batch_size)
        .route(
            Kind::Transactions,
            OutputSpec::to_stage("filter_year_tx", Kind::Transactions, RouteBy::RoundRobin),
        )
        .route(
            Kind::TransactionItems,
            OutputSpec::to_stage("filter_items", Kind::TransactionItems, RouteBy::RoundRobin),
        )
        .route(
            Kind::Stores,
            OutputSpec::to_stage("clean_stores", Kind::Stores, RouteBy::RoundRobin),
        )
        .route(
            Kind::Users,
            OutputSpec::to_stage("clean_users", Kind::Users, RouteBy::RoundRobin),
        )
        .route(
            Kind::MenuItems,
            OutputSpec::to_stage("clean_menu_items", Kind::MenuItems, RouteBy::RoundRobin),
        );

    // base feeds
    t = t
        .stage(
            StageSpec::transform("clean_stores", w("clean_stores"), Kind::Stores, clean_stores)
                .to(OutputSpec::to_topic(STORES_TOPIC, Kind::Stores)),
        )
        .stage(
            StageSpec::transform("clean_users", w("clean_users"), Kind::Users, clean_users)
                .to(OutputSpec::to_topic(USERS_TOPIC, Kind::Users)),
        )
        .stage(
            StageSpec::transform("clean_menu_items", w("clean_menu_items"), Kind::MenuItems, clean_menu_items)
                .to(OutputSpec::to_topic(MENU_ITEMS_TOPIC, Kind::MenuItems)),
        );

    // Q1 and the transaction fan-out
    t = t
        .stage(
            StageSpec::transform("filter_year_tx", w("filter_year_tx"), Kind::Transactions, filter_year_tx)
                .to(OutputSpec::to_stage("filter_hour_tx", Kind::Transactions, RouteBy::RoundRobin))
                .to(OutputSpec::to_stage("reduce_q4", Kind::Transactions, by_id("store_id"))),
        )
        .stage(
            StageSpec::transform("filter_hour_tx", w("filter_hour_tx"), Kind::Transactions, filter_hour_tx)
                .to(OutputSpec::to_stage("filter_amount_tx", Kind::Transactions, RouteBy::RoundRobin))
                .to(OutputSpec::to_stage("reduce_q3", Kind::Transactions, by_id("store_id"))),
        )
        .stage(
            StageSpec::transform("filter_amount_tx", w("filter_amount_tx"), Kind::Transactions, filter_amount_tx)
                .to(OutputSpec::to_results(Kind::Q1)),
        );

    // Q2, twice
    t = t.stage(
        StageSpec::transform("filter_items", w("filter_items"), Kind::TransactionItems, filter_items)
            .to(OutputSpec::to_stage("reduce_q2_quantity", Kind::TransactionItems, by_id("item_id")))
            .to(OutputSpec::to_stage("reduce_q2_profit", Kind::TransactionItems, by_id("item_id"))),
    );
    for (suffix, kind, field, output, decimals) in [
        ("quantity", Kind::Q2Quantity, "quantity", "sellings_qty", 0),
        ("profit", Kind::Q2Profit, "subtotal", "profit_sum", 2),
    ] {
        let reduce = format!("reduce_q2_{suffix}");
        let topk = format!("topk_q2_{suffix}");
        let join = format!("join_q2_{suffix}");
        let sum = SumField::new(field, output).with_decimals(decimals);
        t = t
            .stage(
                StageSpec::reduce(
                    reduce.clone(),
                    w(&reduce),
                    Kind::TransactionItems,
                    ["year_month", "item_id"],
                    Arc::new(sum),
                )
                .to(OutputSpec::to_stage(topk.clone(), kind, by_text("year_month"))),
            )
            .stage(
                StageSpec::top_k(topk.clone(), w(&topk), kind, ["year_month"], (output, "item_id"), cfg.top_items)
                    .to(OutputSpec::to_stage(join.clone(), kind, RouteBy::RoundRobin)),
            )
            .stage(
                StageSpec::join(
                    join.clone(),
                    w(&join),
                    InputSpec::topic(MENU_ITEMS_TOPIC, Kind::MenuItems),
                    kind,
                    JoinSpec::on("item_id", ["item_name"]),
                )
                .to(OutputSpec::to_results(kind)),
            );
    }

    // Q3
    t = t
        .stage(
            StageSpec::reduce(
                "reduce_q3",
                w("reduce_q3"),
                Kind::Transactions,
                ["year_half", "store_id"],
                Arc::new(SumField::new("final_amount", "tpv")),
            )
            .to(OutputSpec::to_stage("join_q3", Kind::Q3, RouteBy::RoundRobin)),
        )
        .stage(
            StageSpec::join(
                "join_q3",
                w("join_q3"),
                InputSpec::topic(STORES_TOPIC, Kind::Stores),
                Kind::Q3,
                JoinSpec::on("store_id", ["store_name"]),
            )
            .to(OutputSpec::to_results(Kind::Q3)),
        );

    // Q4
    t.stage(
        StageSpec::reduce(
            "reduce_q4",
            w("reduce_q4"),
            Kind::Transactions,
            ["store_id", "user_id"],
            Arc::new(CountRows::new("purchases_qty")),
        )
        .to(OutputSpec::to_stage("topk_q4", Kind::Q4, by_id("store_id"))),
    )
    .stage(
        StageSpec::top_k("topk_q4", w("topk_q4"), Kind::Q4, ["store_id"], ("purchases_qty", "user_id"), cfg.top_customers)
            .to(OutputSpec::to_stage("join_q4_users", Kind::Q4, RouteBy::RoundRobin)),
    )
    .stage(
        StageSpec::join(
            "join_q4_users",
            w("join_q4_users"),
            InputSpec::topic(USERS_TOPIC, Kind::Users),
            Kind::Q4,
            JoinSpec::on("user_id", ["birthdate"]),
        )
        .to(OutputSpec::to_stage("join_q4_stores", Kind::Q4, RouteBy::RoundRobin)),
    )
    .stage(
        StageSpec::join(
            "join_q4_stores",
            w("join_q4_stores"),
            InputSpec::topic(STORES_TOPIC, Kind::Stores),
            Kind::Q4,
            JoinSpec::on("store_id", ["store_name"]),
        )
        .to(OutputSpec::to_results(Kind::Q4)),
    )
}
