//! Boundary scenarios: secure-processing rejections, duplicate
//! references, implicit canonicalization, OAEP defaults, and the
//! EncryptedKey timing mitigation, driven through the inbound API with
//! hand-built documents.

use base64::Engine;
use forsmark::core::{algorithm, ns, Error};
use forsmark::stream::{reader, InboundXmlSec, KeyMaterial, KeyUsage, SecurityEvent, XmlSecReader, XmlSecurityProperties};

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn sha1(data: &[u8]) -> Vec<u8> {
    forsmark::crypto::digest::digest(algorithm::SHA1, data).unwrap()
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let alg = forsmark::crypto::sign::from_uri(algorithm::HMAC_SHA1).unwrap();
    alg.sign(&forsmark::crypto::sign::SigningKey::Hmac(key.to_vec()), data)
        .unwrap()
}

/// One `<ds:Reference>` in already-canonical form (tags closed, not
/// self-closed), reusable for both the document and the HMAC input.
fn reference_xml(uri: &str, extra_attrs: &str, transforms: &[&str], digest: &[u8]) -> String {
    let transforms_xml = if transforms.is_empty() {
        String::new()
    } else {
        let inner: String = transforms
            .iter()
            .map(|t| format!("<ds:Transform Algorithm=\"{t}\"></ds:Transform>"))
            .collect();
        format!("<ds:Transforms>{inner}</ds:Transforms>")
    };
    format!(
        "<ds:Reference URI=\"{uri}\"{extra_attrs}>{transforms_xml}\
         <ds:DigestMethod Algorithm=\"{}\"></ds:DigestMethod>\
         <ds:DigestValue>{}</ds:DigestValue></ds:Reference>",
        algorithm::SHA1,
        b64(digest)
    )
}

/// SignedInfo as written in the document and in its exclusive canonical
/// form (which re-declares the ds binding inherited from the Signature).
fn signed_info(references: &str) -> (String, String) {
    let body = format!(
        "<ds:CanonicalizationMethod Algorithm=\"{}\"></ds:CanonicalizationMethod>\
         <ds:SignatureMethod Algorithm=\"{}\"></ds:SignatureMethod>{references}",
        algorithm::EXC_C14N,
        algorithm::HMAC_SHA1
    );
    let in_document = format!("<ds:SignedInfo>{body}</ds:SignedInfo>");
    let canonical = format!(
        "<ds:SignedInfo xmlns:ds=\"{}\">{body}</ds:SignedInfo>",
        ns::DSIG
    );
    (in_document, canonical)
}

fn signature_xml(signed_info: &str, signature_value: &str) -> String {
    format!(
        "<ds:Signature xmlns:ds=\"{}\">{signed_info}\
         <ds:SignatureValue>{signature_value}</ds:SignatureValue></ds:Signature>",
        ns::DSIG
    )
}

fn process(xml: &str, props: XmlSecurityProperties) -> (Result<(), Error>, XmlSecReader) {
    let inbound = InboundXmlSec::new(props).unwrap();
    let mut sec_reader = inbound
        .process(reader::events_from_str(xml).unwrap())
        .unwrap();
    let outcome = sec_reader.read_to_end().map(|_| ());
    (outcome, sec_reader)
}

fn hmac_props(key: &[u8]) -> XmlSecurityProperties {
    let mut props = XmlSecurityProperties::new();
    props.signature_verification_key = Some(KeyMaterial::symmetric(key.to_vec()));
    props
}

fn no_digest_was_computed(sec_reader: &XmlSecReader) {
    assert!(
        !sec_reader.security_events().iter().any(|e| matches!(
            e,
            SecurityEvent::AlgorithmUsed {
                usage: KeyUsage::Digest,
                ..
            }
        )),
        "no reference digest may be computed after a secure-processing rejection"
    );
}

// ── Scenario: manifest rejection ─────────────────────────────────────

#[test]
fn test_manifest_reference_rejected_before_any_digest() {
    let reference = reference_xml(
        "#x",
        &format!(" Type=\"{}\"", ns::DSIG_TYPE_MANIFEST),
        &[],
        &[0u8; 20],
    );
    let (si_doc, _) = signed_info(&reference);
    let xml = format!(
        "<root><data Id=\"x\">v</data>{}</root>",
        signature_xml(&si_doc, "AAAA")
    );

    let (outcome, sec_reader) = process(&xml, hmac_props(b"k"));
    assert!(matches!(outcome.unwrap_err(), Error::InvalidSecurity(_)));
    no_digest_was_computed(&sec_reader);
}

// ── Scenario: duplicate reference ────────────────────────────────────

#[test]
fn test_second_reference_to_same_element_is_duplicate() {
    let key = b"duplicate-test-key";
    let reference = reference_xml("#x", "", &[algorithm::C14N], &[0u8; 20]);
    let two = format!("{reference}{reference}");
    let (si_doc, si_canonical) = signed_info(&two);
    let sv = b64(&hmac_sha1(key, si_canonical.as_bytes()));
    let xml = format!(
        "<root><data Id=\"x\">v</data>{}</root>",
        signature_xml(&si_doc, &sv)
    );

    let (outcome, _) = process(&xml, hmac_props(key));
    assert!(matches!(outcome.unwrap_err(), Error::DuplicateReference(_)));
}

// ── Scenario: enveloped transform with implicit c14n ─────────────────

#[test]
fn test_enveloped_signature_with_implicit_c14n_verifies() {
    let key = b"enveloped-test-key";
    // The digest covers Canonical XML 1.0 of the part with the signature
    // subtree removed: the implicit omit-comments canonicalization that
    // follows a sole enveloped-signature transform.
    let digest = sha1(b"<order Id=\"po1\">total</order>");
    let reference = reference_xml("#po1", "", &[algorithm::ENVELOPED_SIGNATURE], &digest);
    let (si_doc, si_canonical) = signed_info(&reference);
    let sv = b64(&hmac_sha1(key, si_canonical.as_bytes()));
    let xml = format!(
        "<order Id=\"po1\">total{}</order>",
        signature_xml(&si_doc, &sv)
    );

    let (outcome, sec_reader) = process(&xml, hmac_props(key));
    outcome.expect("enveloped signature verifies");
    assert!(sec_reader.verified());
    let results = sec_reader.verification_results();
    assert_eq!(results[0].references[0].uri, "#po1");
    assert!(results[0].references[0].digest_ok);
}

// ── Scenario: external references ────────────────────────────────────

#[test]
fn test_external_reference_rejected_when_disallowed() {
    let reference = reference_xml("payload.bin", "", &[], &[0u8; 20]);
    let (si_doc, _) = signed_info(&reference);
    let xml = format!("<root>{}</root>", signature_xml(&si_doc, "AAAA"));

    let (outcome, sec_reader) = process(&xml, hmac_props(b"k"));
    assert!(matches!(outcome.unwrap_err(), Error::InvalidSecurity(_)));
    no_digest_was_computed(&sec_reader);
}

#[test]
fn test_external_reference_verifies_when_allowed() {
    let dir = std::env::temp_dir().join("forsmark-boundary-external");
    std::fs::create_dir_all(&dir).unwrap();
    let payload = b"external payload bytes";
    std::fs::write(dir.join("payload.bin"), payload).unwrap();

    let key = b"external-test-key";
    let reference = reference_xml("payload.bin", "", &[], &sha1(payload));
    let (si_doc, si_canonical) = signed_info(&reference);
    let sv = b64(&hmac_sha1(key, si_canonical.as_bytes()));
    let xml = format!("<root>{}</root>", signature_xml(&si_doc, &sv));

    let mut props = hmac_props(key);
    props.allow_external_references = true;
    props.base_uri = Some(dir.to_string_lossy().into_owned());

    let (outcome, sec_reader) = process(&xml, props);
    outcome.expect("external reference verifies");
    assert!(sec_reader.verified());
}

// ── Scenario: reference count limit ──────────────────────────────────

#[test]
fn test_reference_limit_fails_before_any_digest() {
    let reference = reference_xml("#x", "", &[], &[0u8; 20]);
    let three = format!("{reference}{reference}{reference}");
    let (si_doc, _) = signed_info(&three);
    let xml = format!(
        "<root><data Id=\"x\">v</data>{}</root>",
        signature_xml(&si_doc, "AAAA")
    );

    let mut props = hmac_props(b"k");
    props.max_references_per_manifest = 2;
    let (outcome, sec_reader) = process(&xml, props);
    assert!(matches!(outcome.unwrap_err(), Error::LimitExceeded(_)));
    no_digest_was_computed(&sec_reader);
}

// ── Scenario: unmatched reference ────────────────────────────────────

#[test]
fn test_unmatched_reference_fails_as_unprocessed() {
    let key = b"unmatched-test-key";
    let reference = reference_xml("#nowhere", "", &[], &[0u8; 20]);
    let (si_doc, si_canonical) = signed_info(&reference);
    let sv = b64(&hmac_sha1(key, si_canonical.as_bytes()));
    let xml = format!(
        "<root><data Id=\"x\">v</data>{}</root>",
        signature_xml(&si_doc, &sv)
    );

    let (outcome, _) = process(&xml, hmac_props(key));
    assert!(matches!(
        outcome.unwrap_err(),
        Error::UnprocessedReference(_)
    ));
}

// ── Scenario: required inbound actions ───────────────────────────────

#[test]
fn test_required_signature_action_missing() {
    let mut props = hmac_props(b"k");
    props
        .required_actions
        .push(forsmark::stream::Action::Sign);
    let (outcome, _) = process("<root><a>x</a></root>", props);
    assert!(matches!(outcome.unwrap_err(), Error::InvalidSecurity(_)));
}

// ── Scenario: RSA-OAEP defaults and the unwrap timing mitigation ─────

fn encrypted_doc_with_wrapped_key(wrapped_key: &[u8], ciphertext: &[u8]) -> String {
    format!(
        r#"<doc><xenc:EncryptedData xmlns:xenc="{enc}" Type="{etype}"><xenc:EncryptionMethod Algorithm="{sym}"></xenc:EncryptionMethod><ds:KeyInfo xmlns:ds="{dsig}"><xenc:EncryptedKey Id="ek1"><xenc:EncryptionMethod Algorithm="{transport}"></xenc:EncryptionMethod><xenc:CipherData><xenc:CipherValue>{wk}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey></ds:KeyInfo><xenc:CipherData><xenc:CipherValue>{ct}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData></doc>"#,
        enc = ns::ENC,
        etype = ns::ENC_TYPE_ELEMENT,
        sym = algorithm::AES256_CBC,
        dsig = ns::DSIG,
        transport = algorithm::RSA_OAEP,
        wk = b64(wrapped_key),
        ct = b64(ciphertext),
    )
}

#[test]
fn test_rsa_oaep_defaults_apply_when_parameters_absent() {
    // EncryptionMethod carries no DigestMethod and no MGF child: SHA-1
    // and MGF1-SHA-1 defaults must line up on both sides.
    let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public = private.to_public_key();

    let session_key = [0x37u8; 32];
    let transport = forsmark::crypto::keytransport::from_uri(algorithm::RSA_OAEP).unwrap();
    let wrapped = transport.encrypt(&public, &session_key).unwrap();

    let cipher = forsmark::crypto::cipher::from_uri(algorithm::AES256_CBC).unwrap();
    let ciphertext = cipher
        .encrypt(&session_key, b"<secret>oaep defaults</secret>")
        .unwrap();

    let xml = encrypted_doc_with_wrapped_key(&wrapped, &ciphertext);
    let mut props = XmlSecurityProperties::new();
    props.decryption_key = Some(KeyMaterial::rsa_private(private));
    let (outcome, _) = process(&xml, props);
    outcome.expect("decryption with OAEP defaults");
}

#[test]
fn test_unwrap_failure_is_mitigated_not_reported() {
    // The wrapped key is random noise: the unwrap cannot succeed, yet the
    // key fetch must not fail. The substituted random session key makes
    // the downstream cipher fail its integrity checks instead.
    let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();

    let cipher = forsmark::crypto::cipher::from_uri(algorithm::AES256_CBC).unwrap();
    let ciphertext = cipher.encrypt(&[0x44u8; 32], b"<secret>x</secret>").unwrap();

    let xml = encrypted_doc_with_wrapped_key(&[0xA5u8; 128], &ciphertext);
    let mut props = XmlSecurityProperties::new();
    props.decryption_key = Some(KeyMaterial::rsa_private(private));
    let (outcome, _) = process(&xml, props);

    let err = outcome.unwrap_err();
    assert!(
        matches!(err, Error::Crypto(_) | Error::XmlParse(_)),
        "failure must surface from the cipher, not the unwrap: {err:?}"
    );
}
