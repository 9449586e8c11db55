use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};

const NONE_FIELD: &str = "-";
const SEPARATOR: char = ':';

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Candles,
    Trades,
    OrderBook,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum Timeframe {
    #[strum(to_string = "1m")]
    #[serde(rename = "1m")]
    OneMinute,
    #[strum(to_string = "3m")]
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[strum(to_string = "5m")]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[strum(to_string = "15m")]
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[strum(to_string = "30m")]
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[strum(to_string = "1h")]
    #[serde(rename = "1h")]
    OneHour,
    #[strum(to_string = "2h")]
    #[serde(rename = "2h")]
    TwoHours,
    #[strum(to_string = "4h")]
    #[serde(rename = "4h")]
    FourHours,
    #[strum(to_string = "6h")]
    #[serde(rename = "6h")]
    SixHours,
    #[strum(to_string = "12h")]
    #[serde(rename = "12h")]
    TwelveHours,
    #[strum(to_string = "1d")]
    #[serde(rename = "1d")]
    OneDay,
    #[strum(to_string = "1w")]
    #[serde(rename = "1w")]
    OneWeek,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Market {
    #[default]
    Spot,
    Futures,
}

/// Identifies one logical upstream data stream.
///
/// Keys are normalized on construction (exchange lowercased, symbol
/// uppercased), so two keys compare equal exactly when their canonical strings
/// do. Serialized form is the canonical string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriptionKey {
    exchange: String,
    symbol: String,
    data_type: DataType,
    timeframe: Option<Timeframe>,
    market: Option<Market>,
}

impl SubscriptionKey {
    pub fn new(exchange: &str, symbol: &str, data_type: DataType) -> Result<Self> {
        Ok(Self {
            exchange: normalize_field("exchange", exchange)?.to_lowercase(),
            symbol: normalize_field("symbol", symbol)?.to_uppercase(),
            data_type,
            timeframe: None,
            market: None,
        })
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<Option<Timeframe>>) -> Self {
        self.timeframe = timeframe.into();
        self
    }

    pub fn with_market(mut self, market: impl Into<Option<Market>>) -> Self {
        self.market = market.into();
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        self.timeframe
    }

    pub fn market(&self) -> Option<Market> {
        self.market
    }

    /// `exchange:SYMBOL:data_type:timeframe:market`, with `-` for absent fields.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

fn normalize_field<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }
    if value == NONE_FIELD || value.contains(SEPARATOR) || value.contains(char::is_whitespace) {
        return Err(anyhow!("{name} '{value}' contains reserved characters"));
    }
    Ok(value)
}

fn optional_field<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => NONE_FIELD.to_string(),
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.exchange,
            self.symbol,
            self.data_type,
            optional_field(&self.timeframe),
            optional_field(&self.market),
        )
    }
}

impl FromStr for SubscriptionKey {
    type Err = anyhow::Error;

    fn from_str(canonical: &str) -> Result<Self> {
        let fields: Vec<&str> = canonical.split(SEPARATOR).collect();
        let [exchange, symbol, data_type, timeframe, market] = fields.as_slice() else {
            return Err(anyhow!(
                "expected 5 fields in subscription key '{canonical}', found {}",
                fields.len()
            ));
        };

        let data_type = DataType::from_str(data_type)
            .with_context(|| format!("invalid data type '{data_type}'"))?;
        let timeframe = match *timeframe {
            NONE_FIELD => None,
            value => Some(
                Timeframe::from_str(value).with_context(|| format!("invalid timeframe '{value}'"))?,
            ),
        };
        let market = match *market {
            NONE_FIELD => None,
            value => {
                Some(Market::from_str(value).with_context(|| format!("invalid market '{value}'"))?)
            }
        };

        Ok(SubscriptionKey::new(exchange, symbol, data_type)?
            .with_timeframe(timeframe)
            .with_market(market))
    }
}

impl TryFrom<String> for SubscriptionKey {
    type Error = anyhow::Error;

    fn try_from(canonical: String) -> Result<Self> {
        canonical.parse()
    }
}

impl From<SubscriptionKey> for String {
    fn from(key: SubscriptionKey) -> Self {
        key.canonical()
    }
}

/// A widget on a particular dashboard that holds subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId {
    dashboard_id: Arc<str>,
    widget_id: u64,
}

impl SubscriberId {
    pub fn new(dashboard_id: impl Into<Arc<str>>, widget_id: u64) -> Self {
        Self {
            dashboard_id: dashboard_id.into(),
            widget_id,
        }
    }

    pub fn dashboard_id(&self) -> &str {
        &self.dashboard_id
    }

    pub fn widget_id(&self) -> u64 {
        self.widget_id
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dashboard_id, self.widget_id)
    }
}
