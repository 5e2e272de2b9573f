//! Stocks Repository

use passbook::{ids::StockUuid, stocks::Stock};

use crate::database::Transaction;

#[derive(Debug, Clone, Default)]
pub(crate) struct MemStocksRepository;

impl MemStocksRepository {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn get_stock(&self, tx: &Transaction, stock: StockUuid) -> Option<Stock> {
        tx.get(stock).await
    }

    pub(crate) fn put_stock(&self, tx: &mut Transaction, stock: Stock) {
        tx.put(stock);
    }
}
