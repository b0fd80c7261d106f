pub const DEFAULT_DNOA_BASE_URL: &str = "https://www.dnoaconnect.com";
pub const DEFAULT_DDINS_BASE_URL: &str = "https://www.deltadentalins.com";

/// DNOA auth tokens go stale well before the portal admits it; refresh early.
pub const DNOA_SESSION_TTL_SECS: i64 = 30 * 60;

pub const DDINS_PROVIDER_TOOLS_REFERER: &str =
    "https://www.deltadentalins.com/provider-tools/v2/eligibility-benefits";
