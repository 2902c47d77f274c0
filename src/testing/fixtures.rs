//! A small coffee-shop dataset for end-to-end tests.
//!
//! Hand-sized so the expected query answers can be worked out on paper:
//!
//! - 3 stores, 5 users, 3 menu items;
//! - 10 transactions across 2023-2025, including one outside business hours,
//!   one from 2023 and one without a user;
//! - 7 transaction items across January-February 2024, plus one from 2023.

use crate::message::Kind;
use crate::row::Row;
use crate::testing::RowsBuilder;
use std::collections::BTreeMap;

#[must_use]
pub fn coffee_shop_stores() -> Vec<Row> {
    RowsBuilder::new(["store_id", "store_name", "city"])
        .add(["1", "G Coffee @ USJ 89q", "Subang Jaya"])
        .add(["2", "G Coffee @ Kondominium Putra", "Seri Kembangan"])
        .add(["3", "G Coffee @ Alam Jaya", "Petaling Jaya"])
        .build()
}

#[must_use]
pub fn coffee_shop_users() -> Vec<Row> {
    RowsBuilder::new(["user_id", "gender", "birthdate", "registered_at"])
        .add(["10", "female", "1990-05-01", "2023-01-01 10:00:00"])
        .add(["11", "male", "1985-11-23", "2023-02-01 10:00:00"])
        .add(["12", "female", "2000-01-15", "2023-03-01 10:00:00"])
        .add(["13", "male", "1979-07-30", "2023-04-01 10:00:00"])
        .add(["14", "female", "1995-03-09", "2023-05-01 10:00:00"])
        .build()
}

#[must_use]
pub fn coffee_shop_menu_items() -> Vec<Row> {
    RowsBuilder::new(["item_id", "item_name", "category", "price"])
        .add(["1", "Espresso", "coffee", "6.0"])
        .add(["2", "Latte", "coffee", "7.0"])
        .add(["3", "Matcha Cake", "cake", "10.0"])
        .build()
}

/// Amounts and hours chosen so that:
/// - large (≥ 75) in-hours 2024-2025 transactions are `t1`, `t3`, `t6`;
/// - `t4` is large but at 05:30, `t7` is from 2023, `t8` has no user.
#[must_use]
pub fn coffee_shop_transactions() -> Vec<Row> {
    RowsBuilder::new(["transaction_id", "store_id", "user_id", "final_amount", "created_at"])
        .add(["t1", "1", "10.0", "80.0", "2024-01-05 10:00:00"])
        .add(["t2", "1", "10", "20.0", "2024-01-06 11:00:00"])
        .add(["t3", "1", "11", "95.5", "2024-07-10 22:30:00"])
        .add(["t4", "2", "12", "150.0", "2025-03-01 05:30:00"])
        .add(["t5", "2", "12", "40.0", "2025-03-02 09:00:00"])
        .add(["t6", "2", "13", "75.0", "2025-08-15 23:00:00"])
        .add(["t7", "3", "14", "200.0", "2023-12-31 12:00:00"])
        .add(["t8", "3", "", "60.0", "2024-02-02 12:00:00"])
        .add(["t9", "3", "14", "10.0", "2024-02-03 13:00:00"])
        .add(["t10", "1", "12", "30.0", "2024-03-03 08:00:00"])
        .build()
}

/// January 2024: Latte leads by quantity (4) and by revenue (28).
/// February 2024: Espresso leads by quantity (5), Matcha Cake by revenue (40).
#[must_use]
pub fn coffee_shop_transaction_items() -> Vec<Row> {
    RowsBuilder::new(["transaction_id", "item_id", "quantity", "unit_price", "subtotal", "created_at"])
        .add(["t1", "1", "2", "6.0", "12.0", "2024-01-05 10:00:00"])
        .add(["t1", "2", "1", "7.0", "7.0", "2024-01-05 10:00:00"])
        .add(["t2", "2", "3", "7.0", "21.0", "2024-01-20 11:00:00"])
        .add(["t3", "3", "1", "10.0", "10.0", "2024-01-25 12:00:00"])
        .add(["t4", "1", "5", "6.0", "30.0", "2024-02-01 09:00:00"])
        .add(["t5", "3", "2", "20.0", "40.0", "2024-02-10 09:00:00"])
        .add(["t6", "1", "1", "6.0", "6.0", "2023-06-01 09:00:00"])
        .build()
}

/// All five datasets by kind, ready for
/// [`SessionGateway::upload_all`](crate::gateway::SessionGateway::upload_all).
#[must_use]
pub fn coffee_shop_datasets() -> BTreeMap<Kind, Vec<Row>> {
    BTreeMap::from([
        (Kind::Transactions, coffee_shop_transactions()),
        (Kind::TransactionItems, coffee_shop_transaction_items()),
        (Kind::Stores, coffee_shop_stores()),
        (Kind::Users, coffee_shop_users()),
        (Kind::MenuItems, coffee_shop_menu_items()),
    ])
}

/// Ten sales over three stores and two months, for reducer scenarios.
///
/// Distinct `(store_id, month)` pairs and their totals:
///
/// | store | month | total |
/// |-------|-------|-------|
/// | 1     | 01    | 30    |
/// | 1     | 02    | 5     |
/// | 2     | 01    | 12.5  |
/// | 2     | 02    | 40    |
/// | 3     | 01    | 7     |
#[must_use]
pub fn ten_sales() -> Vec<Row> {
    RowsBuilder::new(["store_id", "month", "amount"])
        .add(["1", "01", "10"])
        .add(["1", "01", "20"])
        .add(["1", "02", "5"])
        .add(["2", "01", "2.5"])
        .add(["2", "01", "10"])
        .add(["2", "02", "15"])
        .add(["2", "02", "25"])
        .add(["3", "01", "3"])
        .add(["3", "01", "4"])
        .add(["2", "02", "0"])
        .build()
}
