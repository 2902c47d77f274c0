//! Dataset and result files.

#[cfg_attr(docsrs, doc(cfg(feature = "io-csv")))]
#[cfg(feature = "io-csv")]
pub mod csv;

use crate::message::Kind;

/// File (or directory) stem a dataset kind is stored under.
#[must_use]
pub const fn dataset_name(kind: Kind) -> Option<&'static str> {
    match kind {
        Kind::Transactions => Some("transactions"),
        Kind::TransactionItems => Some("transaction_items"),
        Kind::Stores => Some("stores"),
        Kind::Users => Some("users"),
        Kind::MenuItems => Some("menu_items"),
        _ => None,
    }
}

/// File stem a result kind is written under.
#[must_use]
pub const fn result_name(kind: Kind) -> Option<&'static str> {
    match kind {
        Kind::Q1 => Some("q1_large_transactions"),
        Kind::Q2Quantity => Some("q2_top_items_by_quantity"),
        Kind::Q2Profit => Some("q2_top_items_by_profit"),
        Kind::Q3 => Some("q3_tpv_by_store_semester"),
        Kind::Q4 => Some("q4_top_customers"),
        _ => None,
    }
}
