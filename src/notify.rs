//! Trade notifications
//!
//! Fire-and-forget: a sink must never block or fail the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Kind of trade event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Buy,
    PartialTake,
    Stop,
    TrailExit,
    HardStop,
    CooldownSet,
    TrailingArmed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EventKind::Buy => "BUY",
            EventKind::PartialTake => "PARTIAL_TAKE",
            EventKind::Stop => "STOP",
            EventKind::TrailExit => "TRAIL_EXIT",
            EventKind::HardStop => "HARD_STOP",
            EventKind::CooldownSet => "COOLDOWN_SET",
            EventKind::TrailingArmed => "TRAILING_ARMED",
        };
        f.write_str(label)
    }
}

/// Structured trade event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    pub kind: EventKind,
    pub instrument: String,
    pub quantity: f64,
    pub price: f64,
    /// Unrealized or realized percentage at the time of the event
    pub pct: f64,
    /// Estimated realized P&L in quote currency, for exits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    /// Cooldown deadline, for `CooldownSet`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl TradeEvent {
    pub fn new(kind: EventKind, instrument: &str, quantity: f64, price: f64, pct: f64) -> Self {
        Self {
            kind,
            instrument: instrument.to_string(),
            quantity,
            price,
            pct,
            pnl: None,
            until: None,
        }
    }

    pub fn with_pnl(mut self, pnl: f64) -> Self {
        self.pnl = Some(pnl);
        self
    }

    pub fn cooldown(instrument: &str, until: DateTime<Utc>) -> Self {
        Self {
            until: Some(until),
            ..Self::new(EventKind::CooldownSet, instrument, 0.0, 0.0, 0.0)
        }
    }
}

/// Consumer of trade events
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: TradeEvent);
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: TradeEvent) {
        match event.kind {
            EventKind::CooldownSet => info!(
                kind = %event.kind,
                instrument = %event.instrument,
                until = ?event.until,
                "Cooldown set"
            ),
            _ => info!(
                kind = %event.kind,
                instrument = %event.instrument,
                quantity = event.quantity,
                price = event.price,
                pct = event.pct,
                pnl = ?event.pnl,
                "Trade event"
            ),
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TradeEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TradeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: TradeEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropped trade notification: {}", e);
        }
    }
}

/// Fans one event out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl NotificationSink for MultiSink {
    fn notify(&self, event: TradeEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);

        sink.notify(TradeEvent::new(EventKind::Buy, "KRW-XRP", 1.0, 1000.0, 0.0));
        sink.notify(TradeEvent::new(EventKind::Stop, "KRW-XRP", 1.0, 990.0, -1.0));

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Buy);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        sink.notify(TradeEvent::new(EventKind::Buy, "KRW-XRP", 1.0, 1000.0, 0.0));
    }

    #[test]
    fn test_event_serializes_with_kind_label() {
        let event = TradeEvent::new(EventKind::HardStop, "KRW-SOL", 2.0, 97.4, -2.6).with_pnl(-5.3);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "HARD_STOP");
        assert_eq!(json["pnl"], -5.3);
        assert!(json.get("until").is_none());
        assert_eq!(EventKind::TrailExit.to_string(), "TRAIL_EXIT");
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let (a, mut rx_a) = ChannelSink::new(4);
        let (b, mut rx_b) = ChannelSink::new(4);
        let sink = MultiSink::new().with(a).with(b).with(LogSink);

        sink.notify(TradeEvent::cooldown("KRW-XRP", Utc::now()));

        assert_eq!(rx_a.try_recv().unwrap().kind, EventKind::CooldownSet);
        assert_eq!(rx_b.try_recv().unwrap().kind, EventKind::CooldownSet);
    }
}
