//! Weather refresh triggering. The engine only decides *when* a fetch is due
//! and what happens when none has succeeded for too long; the fetch itself
//! (HTTP client, URL encoding, response parsing) is an external collaborator
//! behind [`WeatherFetch`].

use tracing::info;

/// Re-attempt interval between weather calls (seconds). Deliberately not a
/// round number so attempts drift across the hour.
pub const CHECK_WEATHER_TIMEOUT: i64 = 21_613;

/// Without a successful call for this long, automatic scaling falls back to
/// 100% (seconds).
pub const CHECK_WEATHER_SUCCESS_TIMEOUT: i64 = 86_400;

/// Whether the selected adjustment algorithm scales the watering percentage
/// automatically; manual algorithms (0 and 2) leave it to the operator.
pub fn algorithm_uses_auto_scale(algorithm: u8) -> bool {
    !(algorithm == 0 || algorithm == 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherAction {
    None,
    /// The success window lapsed under an automatic algorithm: reset the
    /// watering percentage to 100%.
    ResetScale,
    /// A fetch attempt is due.
    Fetch,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WeatherStatus {
    /// Last attempt, localized seconds.
    pub checkwt_lasttime: Option<i64>,
    /// Last successful update, localized seconds.
    pub checkwt_success_lasttime: Option<i64>,
}

impl WeatherStatus {
    /// Advance the trigger state for this tick. The caller has already ruled
    /// out the suppression conditions (program busy, network failures,
    /// remote-extension mode).
    pub fn evaluate(&mut self, now_local: i64, algorithm: u8) -> WeatherAction {
        if let Some(success) = self.checkwt_success_lasttime {
            if now_local > success + CHECK_WEATHER_SUCCESS_TIMEOUT {
                self.checkwt_success_lasttime = None;
                if algorithm_uses_auto_scale(algorithm) {
                    return WeatherAction::ResetScale;
                }
                return WeatherAction::None;
            }
        }
        match self.checkwt_lasttime {
            Some(last) if now_local <= last + CHECK_WEATHER_TIMEOUT => WeatherAction::None,
            _ => {
                self.checkwt_lasttime = Some(now_local);
                WeatherAction::Fetch
            }
        }
    }

    pub fn record_success(&mut self, now_local: i64) {
        self.checkwt_success_lasttime = Some(now_local);
    }
}

/// External weather client interface. Implementations run off the tick path.
pub trait WeatherFetch: Send {
    fn fetch(&mut self, url: &str, options: &str);
}

/// Default client: log the request and do nothing. The real client lives in
/// the service layer.
pub struct LoggingWeatherFetch;

impl WeatherFetch for LoggingWeatherFetch {
    fn fetch(&mut self, url: &str, options: &str) {
        info!(url, options, "weather fetch requested");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
