use crate::config::CostModel;
use crate::error::BacktestError;
use crate::models::{
    generate_trade_id, Account, Position, Signal, SignalAction, SkippedTrade, Trade, TradeSide,
};
use chrono::NaiveDateTime;
use log::debug;

/// Quantities below this are treated as zero when closing positions.
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Outcome of feeding one signal or order through the simulator.
#[derive(Debug)]
pub enum Execution {
    Filled(Trade),
    Skipped(SkippedTrade),
    Hold,
}

/// Executes signals against a single account, applying slippage and
/// commission, and keeping the append-only run ledger. The simulator is the
/// only code that mutates an account: cash and positions always change
/// together within one call.
pub struct TradeSimulator {
    run_id: String,
    costs: CostModel,
    trades: Vec<Trade>,
    skipped: Vec<SkippedTrade>,
}

impl TradeSimulator {
    pub fn new(run_id: &str, costs: CostModel) -> Self {
        Self {
            run_id: run_id.to_string(),
            costs,
            trades: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn skipped(&self) -> &[SkippedTrade] {
        &self.skipped
    }

    pub fn into_ledger(self) -> (Vec<Trade>, Vec<SkippedTrade>) {
        (self.trades, self.skipped)
    }

    pub fn total_commission(&self) -> f64 {
        self.trades.iter().map(|t| t.commission).sum()
    }

    pub fn total_slippage_cost(&self) -> f64 {
        self.trades.iter().map(|t| t.slippage_cost).sum()
    }

    /// Records an audit entry without touching the account, e.g. for a
    /// contained predictor failure that became an implicit hold.
    pub fn record_skip(
        &mut self,
        timestamp: NaiveDateTime,
        symbol: &str,
        action: SignalAction,
        reason: &str,
    ) {
        self.skipped.push(SkippedTrade {
            timestamp,
            symbol: symbol.to_string(),
            action,
            reason: reason.to_string(),
        });
    }

    /// Executes a predictor signal with default sizing: a buy deploys the
    /// account's available cash, a sell closes the whole position. Used by
    /// single-symbol runs; portfolio rebalancing passes explicit quantities
    /// through [`Self::execute_order`].
    pub fn execute_signal(
        &mut self,
        signal: &Signal,
        execution_price: f64,
        account: &mut Account,
    ) -> Execution {
        match signal.action {
            SignalAction::Hold => Execution::Hold,
            SignalAction::Buy => {
                let slipped = execution_price * (1.0 + self.costs.slippage_rate);
                // Spend what the cash balance can cover after commission.
                let affordable =
                    account.cash / (slipped * (1.0 + self.costs.commission_rate));
                self.buy(signal.timestamp, &signal.symbol, affordable, execution_price, account)
            }
            SignalAction::Sell => {
                let held = account.position_quantity(&signal.symbol);
                self.sell(signal.timestamp, &signal.symbol, held, execution_price, account)
            }
        }
    }

    /// Executes an explicitly sized order, clipping buys to affordable
    /// quantity and rejecting oversells.
    pub fn execute_order(
        &mut self,
        timestamp: NaiveDateTime,
        symbol: &str,
        side: TradeSide,
        quantity: f64,
        execution_price: f64,
        account: &mut Account,
    ) -> Execution {
        match side {
            TradeSide::Buy => self.buy(timestamp, symbol, quantity, execution_price, account),
            TradeSide::Sell => self.sell(timestamp, symbol, quantity, execution_price, account),
        }
    }

    fn buy(
        &mut self,
        timestamp: NaiveDateTime,
        symbol: &str,
        quantity: f64,
        market_price: f64,
        account: &mut Account,
    ) -> Execution {
        if !market_price.is_finite() || market_price <= 0.0 {
            return self.skip(timestamp, symbol, SignalAction::Buy, "unusable market price");
        }

        // Slippage moves the fill against the trader on entry.
        let fill_price = market_price * (1.0 + self.costs.slippage_rate);
        let requested = quantity.max(0.0);
        let mut quantity = requested;

        let total_cost = |qty: f64| qty * fill_price * (1.0 + self.costs.commission_rate);
        let clipped = total_cost(quantity) > account.cash;
        if clipped {
            let affordable = account.cash / (fill_price * (1.0 + self.costs.commission_rate));
            debug!(
                "Clipping buy of {} from {:.4} to affordable {:.4}",
                symbol, quantity, affordable
            );
            quantity = affordable;
        }

        let notional = quantity * fill_price;
        if quantity <= QUANTITY_EPSILON || notional < self.costs.minimum_trade_value {
            let reason = if clipped || account.cash < self.costs.minimum_trade_value {
                BacktestError::InsufficientFunds {
                    required: total_cost(requested).max(self.costs.minimum_trade_value),
                    available: account.cash,
                }
                .to_string()
            } else {
                "notional below minimum trade size".to_string()
            };
            return self.skip(timestamp, symbol, SignalAction::Buy, &reason);
        }

        let commission = notional * self.costs.commission_rate;
        let slippage_cost = quantity * (fill_price - market_price);

        // Cash and position move together; never allow a negative balance.
        account.cash -= notional + commission;
        if account.cash < 0.0 {
            // Guard against float drift from the affordability clip.
            account.cash = 0.0;
        }
        let position = account
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position {
                symbol: symbol.to_string(),
                quantity: 0.0,
                average_cost: 0.0,
            });
        let combined = position.quantity + quantity;
        position.average_cost =
            (position.average_cost * position.quantity + fill_price * quantity) / combined;
        position.quantity = combined;

        let trade = Trade {
            id: generate_trade_id(&self.run_id, symbol, timestamp, self.trades.len()),
            timestamp,
            symbol: symbol.to_string(),
            side: TradeSide::Buy,
            quantity,
            execution_price: fill_price,
            commission,
            slippage_cost,
            realized_pnl: None,
        };
        self.trades.push(trade.clone());
        Execution::Filled(trade)
    }

    fn sell(
        &mut self,
        timestamp: NaiveDateTime,
        symbol: &str,
        quantity: f64,
        market_price: f64,
        account: &mut Account,
    ) -> Execution {
        if !market_price.is_finite() || market_price <= 0.0 {
            return self.skip(timestamp, symbol, SignalAction::Sell, "unusable market price");
        }

        let held = account.position_quantity(symbol);
        if held <= QUANTITY_EPSILON {
            return self.skip(timestamp, symbol, SignalAction::Sell, "no position held");
        }
        if quantity > held * (1.0 + 1e-9) {
            let reason = BacktestError::OverSell {
                symbol: symbol.to_string(),
                requested: quantity,
                held,
            }
            .to_string();
            return self.skip(timestamp, symbol, SignalAction::Sell, &reason);
        }

        let quantity = quantity.min(held);
        if quantity <= QUANTITY_EPSILON {
            return self.skip(timestamp, symbol, SignalAction::Sell, "zero quantity sell");
        }

        // Slippage moves the fill against the trader on exit too.
        let fill_price = market_price * (1.0 - self.costs.slippage_rate);
        let notional = quantity * fill_price;
        let commission = notional * self.costs.commission_rate;
        let slippage_cost = quantity * (market_price - fill_price);

        let average_cost = account
            .positions
            .get(symbol)
            .map(|p| p.average_cost)
            .expect("position checked above");
        let realized_pnl = (fill_price - average_cost) * quantity - commission;

        account.cash += notional - commission;
        let remove = {
            let position = account
                .positions
                .get_mut(symbol)
                .expect("position checked above");
            position.quantity -= quantity;
            position.quantity <= QUANTITY_EPSILON
        };
        if remove {
            account.positions.remove(symbol);
        }

        let trade = Trade {
            id: generate_trade_id(&self.run_id, symbol, timestamp, self.trades.len()),
            timestamp,
            symbol: symbol.to_string(),
            side: TradeSide::Sell,
            quantity,
            execution_price: fill_price,
            commission,
            slippage_cost,
            realized_pnl: Some(realized_pnl),
        };
        self.trades.push(trade.clone());
        Execution::Filled(trade)
    }

    fn skip(
        &mut self,
        timestamp: NaiveDateTime,
        symbol: &str,
        action: SignalAction,
        reason: &str,
    ) -> Execution {
        let entry = SkippedTrade {
            timestamp,
            symbol: symbol.to_string(),
            action,
            reason: reason.to_string(),
        };
        self.skipped.push(entry.clone());
        Execution::Skipped(entry)
    }
}
