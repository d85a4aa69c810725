use std::net::IpAddr;

use maxminddb::{geoip2, MaxMindDBError, Reader};
use tracing::debug;

use crate::errors::{DbError, ErrContext};

/// Look up the autonomous system for `ip` in the database at `dbpath`.
///
/// Returns the ASN in the `"AS" + decimal` form plus the network name.
/// Missing records map to `db_enoent`; records without the expected
/// fields map to `db_enodatafortype`.
pub fn lookup_asn(dbpath: &str, ip: &str) -> Result<(String, String), ErrContext> {
    let reader = open(dbpath)?;
    let record: geoip2::Asn = lookup(&reader, ip)?;

    let number = record
        .autonomous_system_number
        .ok_or_else(|| ErrContext::db(DbError::NoDataForType))?;
    let network_name = record
        .autonomous_system_organization
        .ok_or_else(|| ErrContext::db(DbError::NoDataForType))?;

    debug!(ip, asn = number, network_name, "ASN lookup");

    Ok((format!("AS{number}"), network_name.to_string()))
}

/// Look up the registered-country ISO code for `ip` in the database at
/// `dbpath`.
pub fn lookup_cc(dbpath: &str, ip: &str) -> Result<String, ErrContext> {
    let reader = open(dbpath)?;
    let record: geoip2::Country = lookup(&reader, ip)?;

    let cc = record
        .registered_country
        .and_then(|country| country.iso_code)
        .ok_or_else(|| ErrContext::db(DbError::NoDataForType))?;

    debug!(ip, cc, "country lookup");

    Ok(cc.to_string())
}

fn open(dbpath: &str) -> Result<Reader<maxminddb::Mmap>, ErrContext> {
    Reader::open_mmap(dbpath)
        .map_err(|e| ErrContext::maxminddb(format!("cannot open {dbpath}: {e}")))
}

fn lookup<'a, T: serde::Deserialize<'a>>(
    reader: &'a Reader<maxminddb::Mmap>,
    ip: &str,
) -> Result<T, ErrContext> {
    let address: IpAddr = ip
        .parse()
        .map_err(|e| ErrContext::internal(format!("invalid IP address {ip:?}: {e}")))?;

    match reader.lookup(address) {
        Ok(record) => Ok(record),
        Err(MaxMindDBError::AddressNotFoundError(_)) => Err(ErrContext::db(DbError::NoEntry)),
        Err(e) => Err(ErrContext::maxminddb(e.to_string())),
    }
}
