mod tests_resolver;
