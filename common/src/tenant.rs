use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Namespaces all records and queries. Two tenants with different
/// (account, project) pairs never see each other's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TenantId {
	pub account_id: u32,
	pub project_id: u32,
}

impl TenantId {
	pub const fn new(account_id: u32, project_id: u32) -> Self {
		Self {
			account_id,
			project_id,
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantIdParseError {
	#[error("invalid tenant id {0:?}: expected \"accountID\" or \"accountID:projectID\"")]
	BadFormat(String),
	#[error("invalid tenant id {0:?}: {1}")]
	BadInteger(String, String),
}

impl fmt::Display for TenantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.account_id, self.project_id)
	}
}

// Accepts "accountID" (projectID defaults to 0) or "accountID:projectID",
// mirroring logstorage.ParseTenantID's tolerance for the bare form.
impl FromStr for TenantId {
	type Err = TenantIdParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let parse_u32 = |part: &str| {
			part.parse::<u32>()
				.map_err(|e| TenantIdParseError::BadInteger(s.to_string(), e.to_string()))
		};
		match s.split_once(':') {
			Some((account, project)) => Ok(TenantId {
				account_id: parse_u32(account)?,
				project_id: parse_u32(project)?,
			}),
			None if !s.is_empty() => Ok(TenantId {
				account_id: parse_u32(s)?,
				project_id: 0,
			}),
			None => Err(TenantIdParseError::BadFormat(s.to_string())),
		}
	}
}

/// Parses the `tenant_ids=<marshaled-tenant-list>` cluster request parameter:
/// a comma-separated list of `accountID:projectID` pairs.
pub fn parse_tenant_ids(s: &str) -> Result<Vec<TenantId>, TenantIdParseError> {
	if s.is_empty() {
		return Ok(vec![]);
	}
	s.split(',').map(TenantId::from_str).collect()
}

pub fn marshal_tenant_ids(tenants: &[TenantId]) -> String {
	tenants
		.iter()
		.map(|t| t.to_string())
		.collect::<Vec<_>>()
		.join(",")
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn parses_pair() {
		assert_eq!(
			"12:34".parse::<TenantId>().unwrap(),
			TenantId::new(12, 34)
		);
	}

	#[test]
	fn parses_bare_account() {
		assert_eq!("12".parse::<TenantId>().unwrap(), TenantId::new(12, 0));
	}

	#[test]
	fn rejects_empty() {
		assert!("".parse::<TenantId>().is_err());
	}

	#[test]
	fn roundtrips_marshal() {
		let tenants = vec![TenantId::new(1, 2), TenantId::new(3, 4)];
		let s = marshal_tenant_ids(&tenants);
		assert_eq!(s, "1:2,3:4");
		assert_eq!(parse_tenant_ids(&s).unwrap(), tenants);
	}
}
