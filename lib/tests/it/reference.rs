use proptest::prelude::*;
use retrace_lib::{Digest, Reference, Version};
use simple_test_case::test_case;

#[test_case("docker.io/library/ubuntu:latest", Reference::builder().host("docker.io").repository("library/ubuntu").tag("latest").build(); "docker.io/library/ubuntu:latest")]
#[test_case("ghcr.io/user/repo@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4", Reference::builder().host("ghcr.io").repository("user/repo").digest(digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4")).build(); "ghcr.io/user/repo@sha256")]
#[test_case("docker.io/library/ubuntu", Reference::builder().host("docker.io").repository("library/ubuntu").build(); "docker.io/library/ubuntu")]
#[test_case("localhost:5000/app:dev", Reference::builder().host("localhost:5000").repository("app").tag("dev").build(); "localhost:5000/app:dev")]
#[test]
fn parse(input: &str, expected: Reference) {
    let reference = input.parse::<Reference>().unwrap();
    pretty_assertions::assert_eq!(reference, expected);
}

#[test_case(Reference::builder().host("docker.io").repository("library/ubuntu").tag("latest").build(), "docker.io/library/ubuntu:latest"; "docker.io/library/ubuntu:latest")]
#[test_case(Reference::builder().host("ghcr.io").repository("user/repo").digest(digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4")).build(), "ghcr.io/user/repo@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4"; "ghcr.io/user/repo@sha256")]
#[test_case(Reference::builder().host("ghcr.io").repository("org/project/app").tag("sha-e01ce6b").build(), "ghcr.io/org/project/app:sha-e01ce6b"; "ghcr.io/org/project/app:sha-e01ce6b")]
#[test_case(Reference::builder().host("docker.io").repository("library/ubuntu").build(), "docker.io/library/ubuntu:latest"; "docker.io/library/ubuntu")]
#[test]
fn display(reference: Reference, expected: &str) {
    pretty_assertions::assert_eq!(reference.to_string(), expected);
}

#[test_case("ubuntu", "docker.io/library/ubuntu:latest"; "ubuntu")]
#[test_case("ubuntu:14.04", "docker.io/library/ubuntu:14.04"; "ubuntu:14.04")]
#[test_case("ubuntu@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4", "docker.io/library/ubuntu@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4"; "ubuntu@sha256")]
#[test_case("ubuntu:14.04@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4", "docker.io/library/ubuntu@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4"; "digest wins over tag")]
#[test_case("library/ubuntu", "docker.io/library/ubuntu:latest"; "library/ubuntu")]
#[test_case("contribsys/faktory", "docker.io/contribsys/faktory:latest"; "contribsys/faktory")]
#[test_case("contribsys/faktory:1.0.0", "docker.io/contribsys/faktory:1.0.0"; "contribsys/faktory:1.0.0")]
#[test_case("docker.io/library/ubuntu:14.04", "docker.io/library/ubuntu:14.04"; "docker.io/library/ubuntu:14.04")]
#[test_case("docker.io/ubuntu", "docker.io/library/ubuntu:latest"; "docker.io/ubuntu")]
#[test_case("host.dev/somecorp/someproject/someimage", "host.dev/somecorp/someproject/someimage:latest"; "host.dev/somecorp/someproject/someimage")]
#[test_case("host.dev/somecorp/someproject/someimage@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4", "host.dev/somecorp/someproject/someimage@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4"; "host.dev/somecorp/someproject/someimage@sha256")]
#[test_case("registry.local:5000/team/app:1.2", "registry.local:5000/team/app:1.2"; "host with port")]
#[test]
fn docker_like(input: &str, expected: &str) {
    let reference = input.parse::<Reference>().unwrap();
    pretty_assertions::assert_eq!(reference.to_string(), expected);
}

#[test_case(""; "empty")]
#[test_case("   "; "blank")]
#[test_case("alpine 3.19"; "whitespace")]
#[test_case("/repo:tag"; "/repo:tag")]
#[test_case("host/:tag"; "host/tag")]
#[test_case("host/"; "host/")]
#[test_case("Alpine"; "uppercase repository")]
#[test_case("alpine:"; "empty tag")]
#[test_case("alpine:-bad"; "tag starts with dash")]
#[test_case("alpine@sha256:zz"; "digest not hex")]
#[test_case("alpine@"; "empty digest")]
#[test_case("alpine@sha256:abcd"; "short sha256 digest")]
#[test_case("alpine@md5:00"; "unsupported digest algorithm")]
#[test_case("alpine@SHA256:ABCD"; "uppercase digest")]
#[test_case("alpine@sha256"; "digest without algorithm separator")]
#[test]
fn invalid_references(input: &str) {
    let _ = input.parse::<Reference>().expect_err("must error");
}

#[test]
fn rejects_overlong_names() {
    let input = format!("ghcr.io/{}", "a".repeat(Reference::MAX_NAME_LENGTH));
    let _ = input.parse::<Reference>().expect_err("must error");
}

fn host_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}(\\.[a-z0-9]{1,10}){0,2}\\.[a-z]{2,6}"
}

fn repository_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,10}(-[a-z0-9]{1,5}){0,2}/[a-z][a-z0-9]{0,10}(-[a-z0-9]{1,5}){0,2}"
}

fn tag_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,127}"
}

fn digest_strategy() -> impl Strategy<Value = String> {
    prop_oneof!["sha256:[a-f0-9]{64}", "sha512:[a-f0-9]{128}"]
}

fn reference_strategy() -> impl Strategy<Value = Reference> {
    (
        host_strategy(),
        repository_strategy(),
        prop_oneof![
            tag_strategy().prop_map(Version::Tag),
            digest_strategy().prop_map(|digest| {
                Version::Digest(digest.parse::<Digest>().expect("parse digest"))
            })
        ],
    )
        .prop_map(|(host, repository, version)| Reference {
            host,
            repository,
            version,
        })
}

proptest! {
    #[test]
    fn roundtrip_parse_format(reference in reference_strategy()) {
        let formatted = reference.to_string();
        let parsed = formatted.parse::<Reference>().unwrap();
        prop_assert_eq!(reference, parsed);
    }

    #[test]
    fn parsing_is_idempotent(reference in reference_strategy()) {
        let once = reference.to_string().parse::<Reference>().unwrap().to_string();
        let twice = once.parse::<Reference>().unwrap().to_string();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn rejects_empty_host(repository in repository_strategy(), version in tag_strategy()) {
        let input = format!("/{repository}:{version}");
        prop_assert!(input.parse::<Reference>().is_err());
    }

    #[test]
    fn rejects_empty_repository(host in host_strategy(), version in tag_strategy()) {
        let input = format!("{host}/:{version}");
        prop_assert!(input.parse::<Reference>().is_err());
    }

    #[test]
    fn rejects_truncated_digests(repository in repository_strategy(), digest in "[a-f0-9]{1,63}") {
        let input = format!("{repository}@sha256:{digest}");
        prop_assert!(input.parse::<Reference>().is_err());
    }

    #[test]
    fn default_version_is_latest(host in host_strategy(), repository in repository_strategy()) {
        let input = format!("{host}/{repository}");
        let reference = input.parse::<Reference>().unwrap();
        prop_assert!(matches!(reference.version, Version::Tag(tag) if tag == "latest"));
    }
}
