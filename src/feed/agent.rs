use rand::seq::SliceRandom;

/// Browser-like User-Agent strings used for sources behind an anti-bot wall.
const BROWSER_AGENTS: [&str; 10] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/12.1.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/51.0.2704.79 Safari/537.36 Edge/14.14393",
    "Mozilla/4.0 (compatible; MSIE 8.0; Windows NT 5.1; Trident/4.0; .NET CLR 1.1.4322; .NET CLR 2.0.50727; .NET CLR 3.0.4506.2152; .NET CLR 3.5.30729)",
    "Mozilla/5.0 (iPad; CPU OS 8_4_1 like Mac OS X) AppleWebKit/600.1.4 (KHTML, like Gecko) Version/8.0 Mobile/12H321 Safari/600.1.4",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 10_3_1 like Mac OS X) AppleWebKit/603.1.30 (KHTML, like Gecko) Version/10.0 Mobile/14E304 Safari/602.1",
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
    "Mozilla/5.0 (Linux; Android 5.0; SAMSUNG SM-N900 Build/LRX21V) AppleWebKit/537.36 (KHTML, like Gecko) SamsungBrowser/2.1 Chrome/34.0.1847.76 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 6.0.1; SAMSUNG SM-G570Y Build/MMB29K) AppleWebKit/537.36 (KHTML, like Gecko) SamsungBrowser/4.0 Chrome/44.0.2403.133 Mobile Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:53.0) Gecko/20100101 Firefox/53.0",
];

/// Where browser-like User-Agent strings come from.
///
/// Injected into the fetch client so tests can pin the agent.
pub trait AgentSource: Send + Sync {
    fn browser_agent(&self) -> String;
}

/// Picks uniformly from a fixed pool of real browser strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBrowserAgents;

impl AgentSource for RandomBrowserAgents {
    fn browser_agent(&self) -> String {
        BROWSER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(BROWSER_AGENTS[0])
            .to_string()
    }
}

/// Always returns the same string.
#[derive(Debug, Clone)]
pub struct FixedAgent(pub String);

impl AgentSource for FixedAgent {
    fn browser_agent(&self) -> String {
        self.0.clone()
    }
}

/// The honest User-Agent: who is polling and for how many readers.
pub fn operator_agent(user_agent: &str, server_url: &str, num_subs: i64) -> String {
    format!("{user_agent} (+{server_url}; Updater; {num_subs} subscribers)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_agent_format() {
        assert_eq!(
            operator_agent("feedtide/0.1.0", "https://example.org", 3),
            "feedtide/0.1.0 (+https://example.org; Updater; 3 subscribers)"
        );
    }

    #[test]
    fn test_random_agent_comes_from_pool() {
        let agents = RandomBrowserAgents;
        for _ in 0..20 {
            let agent = agents.browser_agent();
            assert!(BROWSER_AGENTS.contains(&agent.as_str()));
        }
    }

    #[test]
    fn test_fixed_agent() {
        let agent = FixedAgent("TestBrowser/1.0".to_string());
        assert_eq!(agent.browser_agent(), "TestBrowser/1.0");
    }
}
