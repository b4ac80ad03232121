#![no_main]

use std::sync::{Arc, LazyLock};

use libfuzzer_sys::fuzz_target;
use ssh_jump_server::certificate_authority::{
    AuthContext, CertificateAuthenticator, OfferedCredential, TrustedAuthority,
};

const CA_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g fuzz-ca";

static AUTHENTICATOR: LazyLock<CertificateAuthenticator> = LazyLock::new(|| {
    let authority = TrustedAuthority::from_openssh(CA_KEY).unwrap();
    CertificateAuthenticator::new(Arc::new(authority), vec!["verify-required".to_string()])
});

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let credential = OfferedCredential::from_openssh(s);
        let ctx = AuthContext {
            user: "alice",
            peer: Some([127, 0, 0, 1].into()),
        };
        // nothing here is signed by the fuzz CA
        assert!(!AUTHENTICATOR.authenticate_at(&ctx, &credential, 1_700_000_000));
    }
});
