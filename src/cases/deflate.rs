//! Families 12 and 13: permessage-deflate

use crate::catalog::CatalogBuilder;
use crate::compression::{AcceptRule, PerMessageDeflateOffer};
use crate::corpus::CorpusKey;
use crate::script::CompressedEchoRoundTrip;

/// (message size, message count, wait seconds, auto-fragment size)
const MESSAGE_SIZES: [(usize, usize, f64, usize); 18] = [
    (16, 1000, 60.0, 0),
    (64, 1000, 60.0, 0),
    (256, 1000, 120.0, 0),
    (1024, 1000, 240.0, 0),
    (4096, 1000, 480.0, 0),
    (8192, 1000, 480.0, 0),
    (16384, 1000, 480.0, 0),
    (32768, 1000, 480.0, 0),
    (65536, 1000, 480.0, 0),
    (131072, 1000, 480.0, 0),
    (8192, 1000, 480.0, 256),
    (16384, 1000, 480.0, 256),
    (32768, 1000, 480.0, 256),
    (65536, 1000, 480.0, 256),
    (131072, 1000, 480.0, 256),
    (131072, 1000, 480.0, 1024),
    (131072, 1000, 480.0, 4096),
    (131072, 1000, 480.0, 32768),
];

/// Corpus every 13.x sub-category echoes
const PARAMETER_CORPUS: CorpusKey = CorpusKey::JsonData1;

/// Server acceptance rules and client offers crossed in 13.x
fn deflate_parameters() -> Vec<(Vec<AcceptRule>, Vec<PerMessageDeflateOffer>)> {
    vec![
        (
            vec![AcceptRule::new(false, 0)],
            vec![PerMessageDeflateOffer::default()],
        ),
        (
            vec![AcceptRule::new(true, 0)],
            vec![PerMessageDeflateOffer::new(true, 0)],
        ),
        (
            vec![AcceptRule::new(false, 8)],
            vec![PerMessageDeflateOffer::new(false, 8)],
        ),
        (
            vec![AcceptRule::new(false, 15)],
            vec![PerMessageDeflateOffer::new(false, 15)],
        ),
        (
            vec![AcceptRule::new(true, 8)],
            vec![PerMessageDeflateOffer::new(true, 8)],
        ),
        (
            vec![AcceptRule::new(true, 15)],
            vec![PerMessageDeflateOffer::new(true, 15)],
        ),
        (
            vec![
                AcceptRule::new(true, 8),
                AcceptRule::new(true, 0),
                AcceptRule::new(false, 0),
            ],
            vec![
                PerMessageDeflateOffer::new(true, 8),
                PerMessageDeflateOffer::new(true, 0),
                PerMessageDeflateOffer::default(),
            ],
        ),
    ]
}

fn corpus_title(key: CorpusKey) -> String {
    format!(
        "{} ({})",
        key.description(),
        if key.is_binary() { "binary" } else { "utf8" }
    )
}

fn pairs<T>(list: &[T], f: impl Fn(&T) -> (bool, u8)) -> String {
    let items: Vec<String> = list
        .iter()
        .map(|x| {
            let (no_context_takeover, bits) = f(x);
            format!(
                "({}, {})",
                if no_context_takeover { "True" } else { "False" },
                bits
            )
        })
        .collect();
    format!("[{}]", items.join(", "))
}

fn register_sizes(
    b: &mut CatalogBuilder,
    prefix: [u32; 2],
    corpus: CorpusKey,
    offers: &[PerMessageDeflateOffer],
    accept_rules: &[AcceptRule],
    use_what: &str,
) {
    for (n, (len, count, wait_secs, auto_fragment)) in (1u32..).zip(MESSAGE_SIZES) {
        b.case(
            &[prefix[0], prefix[1], n],
            format!(
                "Send {} compressed messages each of payload size {}, auto-fragment to {} octets. Use {}",
                count, len, auto_fragment, use_what
            ),
            format!(
                "Receive echo'ed messages (with payload as sent). Timeout case after {} secs.",
                wait_secs
            ),
            CompressedEchoRoundTrip {
                corpus,
                len,
                count,
                wait_secs,
                auto_fragment: (auto_fragment > 0).then_some(auto_fragment),
                offers: offers.to_vec(),
                accept_rules: accept_rules.to_vec(),
            },
        );
    }
}

pub(super) fn register(b: &mut CatalogBuilder) {
    b.title(&[12], "WebSocket Compression (different payloads)");
    for (sub, corpus) in (1u32..).zip(CorpusKey::ALL) {
        b.title(&[12, sub], corpus_title(corpus));
        register_sizes(
            b,
            [12, sub],
            corpus,
            &[PerMessageDeflateOffer::default()],
            &[AcceptRule::default()],
            "default permessage-deflate offer.",
        );
    }

    b.title(&[13], "WebSocket Compression (different parameters)");
    for (sub, (accept_rules, offers)) in (1u32..).zip(deflate_parameters()) {
        let offers_desc = format!(
            "client offers (requestNoContextTakeover, requestMaxWindowBits): {}",
            pairs(&offers, |o| (o.request_no_context_takeover, o.request_max_window_bits))
        );
        let accept_desc = format!(
            "server accept (requestNoContextTakeover, requestMaxWindowBits): {}",
            pairs(&accept_rules, |r| (r.request_no_context_takeover, r.request_max_window_bits))
        );
        b.title(
            &[13, sub],
            format!("{} - {} / {}", corpus_title(PARAMETER_CORPUS), offers_desc, accept_desc),
        );
        register_sizes(
            b,
            [13, sub],
            PARAMETER_CORPUS,
            &offers,
            &accept_rules,
            &format!("permessage-deflate {}", offers_desc),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::PerMessageDeflateAccept;

    #[test]
    fn test_every_parameter_set_negotiates_with_its_own_offers() {
        for (rules, offers) in deflate_parameters() {
            let accept = PerMessageDeflateAccept::choose(&rules, &offers)
                .expect("own offers should be acceptable");
            assert_eq!(accept.rule, rules[0]);
        }
    }

    #[test]
    fn test_pairs_formatting() {
        let offers = [PerMessageDeflateOffer::new(true, 8), PerMessageDeflateOffer::default()];
        assert_eq!(
            pairs(&offers, |o| (o.request_no_context_takeover, o.request_max_window_bits)),
            "[(True, 8), (False, 0)]"
        );
    }
}
