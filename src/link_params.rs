use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::warn;
use url::Url;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Display dates are rendered in a fixed UTC+8 calendar.
const DISPLAY_OFFSET_HOURS: i64 = 8;

/// Parameters embedded in a long URL that drive link metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkParams {
    pub uid: Option<String>,
    /// Expiry as epoch milliseconds.
    pub exp: Option<i64>,
}

impl LinkParams {
    /// Extracts `uid` and `exp` from the query of `long_url`.
    ///
    /// Hash-routed pages carry their query inside the fragment
    /// (`https://host/#/play?uid=a&exp=1`), so that query is read too.
    /// The real query takes precedence when both carry a parameter.
    ///
    /// # Errors
    /// Will return [`Err`] if `long_url` is not an absolute URL.
    pub fn from_long_url(long_url: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(long_url)?;

        let fragment_query = url
            .fragment()
            .and_then(|fragment| fragment.split_once('?'))
            .map(|(_, query)| query);

        // NOTE: a '+' in a uid is literal, not an encoded space
        let queries: Vec<String> = [url.query(), fragment_query]
            .into_iter()
            .flatten()
            .map(|query| query.replace('+', "%2B"))
            .collect();

        let mut uid = None;
        let mut exp = None;
        let pairs = queries
            .iter()
            .flat_map(|query| url::form_urlencoded::parse(query.as_bytes()));
        for (name, value) in pairs {
            match name.as_ref() {
                "uid" if uid.is_none() && !value.is_empty() => uid = Some(value.into_owned()),
                "exp" if exp.is_none() => exp = parse_exp(&value),
                _ => {}
            }
        }

        Ok(Self { uid, exp })
    }
}

fn parse_exp(raw: &str) -> Option<i64> {
    match raw.parse::<i64>() {
        Ok(millis) if millis > 0 => Some(millis),
        _ => {
            warn!(exp = %raw, "Ignoring exp parameter that is not a positive epoch-millis integer");
            None
        }
    }
}

/// How long an expiring link lives, bucketed by days left until `exp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryClass {
    Permanent,
    OneYear,
    OneMonth,
    ShortTerm,
}

impl ExpiryClass {
    #[must_use]
    pub fn classify(exp: OffsetDateTime, now: OffsetDateTime) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let days_left = (exp - now).whole_milliseconds() as f64 / MILLIS_PER_DAY;
        if days_left > 35_000.0 {
            Self::Permanent
        } else if days_left > 300.0 {
            Self::OneYear
        } else if days_left > 25.0 {
            Self::OneMonth
        } else {
            Self::ShortTerm
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::OneYear => "1 year",
            Self::OneMonth => "1 month",
            Self::ShortTerm => "short-term",
        }
    }

    /// Permanent links are stored without an expiry and are never swept.
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// An `exp` parameter resolved against the current time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expiry {
    pub at: OffsetDateTime,
    pub class: ExpiryClass,
}

impl Expiry {
    #[must_use]
    pub fn resolve(exp_millis: i64, now: OffsetDateTime) -> Option<Self> {
        let at = from_epoch_millis(exp_millis)?;
        Some(Self {
            at,
            class: ExpiryClass::classify(at, now),
        })
    }

    /// The expiry that gets stored and swept; `None` for permanent links.
    #[must_use]
    pub fn stored_millis(&self) -> Option<i64> {
        (!self.class.is_permanent()).then(|| to_epoch_millis(self.at))
    }
}

#[must_use]
pub fn from_epoch_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

#[must_use]
pub fn to_epoch_millis(time: OffsetDateTime) -> i64 {
    i64::try_from(time.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Calendar date of `time` in the fixed display offset, as `YYYY-MM-DD`.
#[must_use]
pub fn display_date(time: OffsetDateTime) -> String {
    let utc = time.to_offset(UtcOffset::UTC);
    let date = utc
        .checked_add(Duration::hours(DISPLAY_OFFSET_HOURS))
        .unwrap_or(utc)
        .date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[must_use]
pub fn synthesize_title(uid: Option<&str>, expiry: Option<&Expiry>, now: OffsetDateTime) -> String {
    let today = display_date(now);
    let prefix = uid.map(|uid| format!("{uid} · ")).unwrap_or_default();
    match expiry {
        Some(expiry) => format!(
            "{prefix}expires {} · OTT {} link ({today})",
            display_date(expiry.at),
            expiry.class.label()
        ),
        None => format!("{prefix}OTT link ({today})"),
    }
}

/// A fresh provider path: `"id"` followed by 4 or 5 random digits.
#[must_use]
pub fn generate_link_id() -> String {
    format!("id{}", rand::random_range(1000..=90_999_u32))
}
