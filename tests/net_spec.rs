//! Network specification end-to-end parsing tests.

use portod::addr::NetAddr;
use portod::error::ErrorKind;
use portod::netcfg::{IfaceRequest, NetConfig, NsSource};

#[test]
fn test_full_spec_parses() {
    let text = "\
steal eth3
macvlan eth0 mv0 bridge 1400 02:aa:bb:cc:dd:ee
ipvlan eth1 iv0 l3
veth veth0 br0 1500
L3 l3if
NAT
MTU mv0 1380
autoconf iv0
";
    let mut cfg = NetConfig::parse(text).expect("spec should parse");
    cfg.parse_ip("l3if 10.42.0.17").expect("ip line");
    cfg.parse_gw("veth0 192.168.1.1").expect("gw line");

    assert_eq!(cfg.source(), NsSource::New);
    assert_eq!(cfg.ifaces.len(), 6);
    assert_eq!(cfg.autoconf, vec!["iv0".to_string()]);

    // The MTU line retargets the earlier macvlan.
    match &cfg.ifaces[1] {
        IfaceRequest::MacVlan(r) => {
            assert_eq!(r.name, "mv0");
            assert_eq!(r.mtu, Some(1380));
        }
        other => panic!("unexpected request {:?}", other),
    }

    match &cfg.ifaces[5] {
        IfaceRequest::Nat(name) => assert_eq!(name, "eth0"),
        other => panic!("unexpected request {:?}", other),
    }

    assert_eq!(cfg.ip[0].1, NetAddr::parse("10.42.0.17").unwrap());
}

#[test]
fn test_namespace_sources_are_exclusive() {
    for text in [
        "none\nNAT",
        "inherited\nveth eth0 br0",
        "netns blue\nsteal eth0",
        "container web\nL3",
        "none\nnone",
        "netns a\nnetns b",
    ] {
        let err = NetConfig::parse(text).expect_err(text);
        assert_eq!(err.kind, ErrorKind::InvalidValue, "{}", text);
    }
}

#[test]
fn test_unknown_keyword_rejected() {
    let err = NetConfig::parse("bond0 eth0").expect_err("unknown keyword");
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_macvlan_literal_scenario() {
    // The literal acceptance scenario for macvlan parsing.
    let cfg = NetConfig::parse("macvlan eth0 mv0 bridge 1400 02:aa:bb:cc:dd:ee").unwrap();
    match &cfg.ifaces[0] {
        IfaceRequest::MacVlan(r) => {
            assert_eq!(r.master, "eth0");
            assert_eq!(r.name, "mv0");
            assert_eq!(r.mtu, Some(1400));
            assert_eq!(r.hw, Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]));
        }
        other => panic!("unexpected request {:?}", other),
    }

    let err = NetConfig::parse("macvlan eth0 mv0 foo").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}
